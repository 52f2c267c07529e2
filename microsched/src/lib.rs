//! Fork-join task scheduling on a fixed pool of worker threads.
//!
//! Client code allocates [`TaskHandle`]s from a [`Scheduler`], wires them into a
//! graph with continuations and join counters, and spawns them. Workers run
//! their own queue as a stack and steal the oldest work from their peers. A
//! thread calling [`Scheduler::spawn_task_and_wait`] joins the workers until
//! the awaited subgraph has completed.

#[doc(inline)]
pub use microsched_macros::test;

mod error;
pub use error::{PoolError, SchedulerError};

pub mod pool;
pub use pool::WorkerPool;

pub mod scheduler;
pub use scheduler::{Scheduler, SchedulerConfig, TaskContext};

pub mod task;
pub use task::{Continuation, PAYLOAD_CAPACITY, Task, TaskFn, TaskHandle, TaskId, TaskState};

mod utils;

#[cfg(test)]
mod test_utils;
