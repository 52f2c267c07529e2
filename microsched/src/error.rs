use std::io;

/// Errors surfaced by [`WorkerPool`](crate::WorkerPool) lifecycle operations.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The platform refused to start a worker thread. Threads started before
    /// the failure have been stopped and joined; the pool is unusable.
    #[error("failed to spawn worker thread {index}: {source}")]
    ThreadCreation {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("worker pool was already initialized")]
    AlreadyInitialized,

    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(#[source] anyhow::Error),

    /// Reported once by `shutdown` if tasks panicked on worker threads.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

/// Errors surfaced by [`Scheduler`](crate::Scheduler) operations.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    /// Every slot of the task arena is in use and it reached its growth ceiling.
    #[error("task arena exhausted: all {capacity} task slots are in use")]
    Allocation { capacity: usize },

    #[error("worker pool is not running")]
    NotInitialized,

    #[error("scheduler has been shut down")]
    ShutDown,

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(#[source] anyhow::Error),
}

impl SchedulerError {
    /// The arena frees slots as graphs complete, so an allocation can succeed
    /// later. Every other error is permanent for this scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Allocation { .. })
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}
