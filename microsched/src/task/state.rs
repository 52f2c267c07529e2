use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a task. A task moves through each state exactly once.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Owned by a [`TaskHandle`](crate::TaskHandle) or installed as a
    /// continuation, not yet visible to any worker.
    Allocated = 0,

    /// Sitting in a queue, or about to run as a bypassed next task.
    Queued = 1,

    /// The callable is executing, or has returned and the task is waiting for
    /// children reserved on itself.
    Running = 2,

    Completed = 3,
}

impl TaskState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Allocated,
            1 => TaskState::Queued,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            _ => unreachable!("invalid task state {}", val),
        }
    }
}

#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) const fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from -> to`. On failure returns the state that was found.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> Result<(), TaskState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskState::from_u8)
    }
}
