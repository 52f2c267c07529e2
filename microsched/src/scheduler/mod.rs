//! Binds task graphs to the workers of a [`WorkerPool`].
//!
//! Every worker owns a LIFO deque that peers steal from, plus an affinity
//! mailbox. Tasks spawned from outside the pool land in a global injector.
//! Workers look for work in this order:
//!
//! 1. the injector, every `global_queue_interval` ticks,
//! 2. their own mailbox,
//! 3. their own deque,
//! 4. the injector and their peers' deques, starting at a random victim,
//! 5. their peers' mailboxes, so affinity never leaves a worker starving.

use crate::error::SchedulerError;
use crate::pool::{self, EventLoop, WorkerPool};
use crate::task::{TaskArena, TaskFn, TaskHandle, TaskId};
use crossbeam_deque::Injector;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

mod config;
pub use config::SchedulerConfig;

mod context;
pub use context::TaskContext;

mod ticker;

mod wait;

mod worker;
use worker::WorkerQueues;

#[cfg(test)]
mod tests;

/// A fork-join scheduler bound to a [`WorkerPool`].
///
/// `Scheduler` is a cheap handle: clones refer to the same queues and arena.
/// Pool threads keep it alive until [`Scheduler::shutdown`] is called or the
/// pool shuts down.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pool: Arc<pool::Shared>,
    registration: OnceLock<u64>,
    running: AtomicBool,

    cfg: SchedulerConfig,
    arena: TaskArena,

    /// Tasks spawned from threads outside the execution loop.
    injector: Injector<TaskId>,

    /// One entry per worker index.
    workers: Box<[WorkerQueues]>,
}

impl Scheduler {
    /// Binds a scheduler with the default configuration to `pool`.
    pub fn try_new(pool: &WorkerPool) -> Result<Self, SchedulerError> {
        Self::try_with_config(pool, SchedulerConfig::default())
    }

    /// Binds a scheduler to `pool`, allocating one set of queues per worker.
    ///
    /// Fails with [`SchedulerError::NotInitialized`] unless the pool is
    /// running. Each call creates an independent scheduler; several of them can
    /// share a pool.
    pub fn try_with_config(pool: &WorkerPool, cfg: SchedulerConfig) -> Result<Self, SchedulerError> {
        cfg.validate().map_err(SchedulerError::InvalidConfig)?;

        let pool = pool.shared().ok_or(SchedulerError::NotInitialized)?;
        let worker_count = pool.thread_count();

        let scheduler = Scheduler {
            shared: Arc::new(Shared {
                pool,
                registration: OnceLock::new(),
                running: AtomicBool::new(true),
                arena: TaskArena::new(&cfg, worker_count),
                cfg,
                injector: Injector::new(),
                workers: (0..worker_count).map(|_| WorkerQueues::new()).collect(),
            }),
        };

        let id = scheduler
            .shared
            .pool
            .register(Arc::new(scheduler.clone()));
        let _ = scheduler.shared.registration.set(id);

        tracing::debug!(
            worker_count,
            capacity = scheduler.arena_capacity(),
            "scheduler bound to worker pool"
        );

        Ok(scheduler)
    }

    /// Number of workers, and therefore of task queues.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Tasks allocated and not yet completed or discarded.
    pub fn live_tasks(&self) -> usize {
        self.shared.arena.live()
    }

    /// Maximum number of live tasks.
    pub fn arena_capacity(&self) -> usize {
        self.shared.arena.capacity()
    }

    pub(crate) fn arena(&self) -> &TaskArena {
        &self.shared.arena
    }

    pub(crate) fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Allocates a task running `func`. The task does nothing until it is
    /// spawned, directly or as a continuation.
    pub fn allocate_task(&self, func: TaskFn) -> Result<TaskHandle<'_>, SchedulerError> {
        self.allocate_from(None, func)
    }

    pub(crate) fn allocate_from(
        &self,
        worker: Option<usize>,
        func: TaskFn,
    ) -> Result<TaskHandle<'_>, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::ShutDown);
        }

        let id = self.shared.arena.allocate(worker, func)?;
        Ok(TaskHandle::new(id, self))
    }

    /// Queues `task` and returns right away. It never runs inline.
    ///
    /// Without affinity the task goes to the global queue; tasks spawning
    /// children should use [`TaskContext::spawn_task`] to keep them local.
    pub fn spawn_task(&self, task: TaskHandle<'_>) {
        self.spawn_from(None, task);
    }

    /// Spawns `task` and executes tasks on the calling thread until `task`, its
    /// descendants and the continuations they lead to have all completed.
    ///
    /// The calling thread takes the root worker slot and only parks while no
    /// work is available anywhere.
    pub fn spawn_task_and_wait(&self, task: TaskHandle<'_>) -> Result<(), SchedulerError> {
        self.wait_on(0, task)
    }

    pub(crate) fn spawn_from(&self, worker: Option<usize>, task: TaskHandle<'_>) {
        debug_assert!(
            task.scheduler().ptr_eq(self),
            "task {} belongs to another scheduler",
            task.id()
        );
        debug_assert!(self.is_running(), "spawn on a scheduler that was shut down");

        let affinity = task.affinity();
        let id = task.into_raw();

        self.shared.arena.slot(id).arm(id);
        self.enqueue(worker, id, affinity);
    }

    /// Publishes a queued task, then wakes a parked thread to pick it up.
    pub(crate) fn enqueue(&self, worker: Option<usize>, id: TaskId, affinity: Option<usize>) {
        let shared = &*self.shared;

        match (affinity, worker) {
            (Some(target), _) => shared.workers[target].mailbox.push(id),
            (None, Some(index)) => shared.workers[index].local.lock().push(id),
            (None, None) => shared.injector.push(id),
        }

        shared.pool.sleepers.notify_one();
    }

    /// Unbinds the scheduler from its pool. Idempotent.
    ///
    /// Every spawned graph must have completed; later waits fail with
    /// [`SchedulerError::ShutDown`].
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(id) = self.shared.registration.get() {
            self.shared.pool.unregister(*id);
        }

        debug_assert!(
            !self.has_any_work(),
            "scheduler shut down with queued tasks"
        );

        tracing::debug!(
            live_tasks = self.live_tasks(),
            "scheduler unbound from worker pool"
        );
    }
}

impl EventLoop for Scheduler {
    fn run_once(&self, worker_index: usize) -> bool {
        match self.find_task(worker_index) {
            Some(id) => {
                self.execute(worker_index, id);
                true
            }
            None => false,
        }
    }

    fn has_work(&self, _worker_index: usize) -> bool {
        self.has_any_work()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.worker_count())
            .field("running", &self.is_running())
            .field("cfg", &self.shared.cfg)
            .field("arena", &self.shared.arena)
            .finish_non_exhaustive()
    }
}
