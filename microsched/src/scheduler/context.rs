use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::task::{TaskFn, TaskHandle};

/// What a running task knows about where it runs.
///
/// Built for each invocation of a task's callable and only valid for its
/// duration.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'s> {
    worker_index: usize,
    scheduler: &'s Scheduler,
}

impl<'s> TaskContext<'s> {
    pub(crate) fn new(worker_index: usize, scheduler: &'s Scheduler) -> Self {
        Self {
            worker_index,
            scheduler,
        }
    }

    /// Index of the worker executing the task, in `[0, worker_count)`.
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn scheduler(&self) -> &'s Scheduler {
        self.scheduler
    }

    /// Allocates a task, reusing slots freed by this worker first.
    pub fn allocate_task(&self, func: TaskFn) -> Result<TaskHandle<'s>, SchedulerError> {
        self.scheduler.allocate_from(Some(self.worker_index), func)
    }

    /// Pushes `task` on this worker's own queue, unless it has an affinity.
    pub fn spawn_task(&self, task: TaskHandle<'s>) {
        self.scheduler.spawn_from(Some(self.worker_index), task);
    }

    /// Spawns `task` and keeps executing tasks on this worker until its
    /// subgraph has completed.
    pub fn spawn_task_and_wait(&self, task: TaskHandle<'s>) -> Result<(), SchedulerError> {
        self.scheduler.wait_on(self.worker_index, task)
    }
}
