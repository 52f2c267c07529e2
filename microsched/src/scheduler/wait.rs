use crate::error::SchedulerError;
use crate::pool::{IdleAction, TieredIdle};
use crate::scheduler::Scheduler;
use crate::task::TaskHandle;
use crate::task::join::{Joiner, WaitLatch};

impl Scheduler {
    /// Spawns `task` on behalf of worker `index`, then drives that worker's
    /// loop on the calling thread until the task's subgraph has completed.
    pub(crate) fn wait_on(&self, index: usize, mut task: TaskHandle<'_>) -> Result<(), SchedulerError> {
        if !self.is_running() {
            debug_assert!(false, "spawn_task_and_wait on a scheduler that was shut down");
            return Err(SchedulerError::ShutDown);
        }

        debug_assert!(
            task.body().parent.is_none(),
            "awaited task {} is registered as a child",
            task.id()
        );

        let latch = WaitLatch::new();
        task.body_mut().parent = Some(Joiner::Latch(latch.clone()));

        self.spawn_from(Some(index), task);
        self.run_until(index, &latch);

        Ok(())
    }

    fn run_until(&self, index: usize, latch: &WaitLatch) {
        let pool = &self.shared.pool;
        let mut idle = TieredIdle::new(pool.spin_iters());

        while !latch.is_done() {
            if let Some(id) = self.find_task(index) {
                self.execute(index, id);
                idle.on_work();
                continue;
            }

            if idle.on_idle() == IdleAction::Continue {
                continue;
            }

            // The latch unparks us directly, the sleepers list covers new work.
            pool.sleepers.park(
                || latch.is_done() || self.has_any_work(),
                pool.park_timeout(),
            );
            idle.on_work();
        }
    }
}
