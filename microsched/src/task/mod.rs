//! Tasks and the storage backing them.
//!
//! A task lives in a slot of the scheduler's [`TaskArena`] from allocation
//! until it completes. Client code only ever sees it through a [`TaskHandle`]
//! before it is spawned, and as a [`Task`] while its callable runs.

mod arena;
pub(crate) use arena::TaskArena;

mod id;
pub use id::TaskId;

pub(crate) mod join;

mod payload;
pub use payload::PAYLOAD_CAPACITY;

pub(crate) mod slot;

mod state;
pub use state::TaskState;

#[allow(clippy::module_inception)]
mod task;
pub use task::{Continuation, Task, TaskFn, TaskHandle};
