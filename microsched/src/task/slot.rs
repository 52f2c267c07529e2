use crate::task::join::{JoinCounter, Joiner};
use crate::task::payload::Payload;
use crate::task::state::{AtomicTaskState, TaskState};
use crate::task::{TaskFn, TaskId};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Reservations and registrations made by a running task, checked when it
/// returns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JoinBook {
    pub(crate) reserved_self: u32,
    pub(crate) registered_self: u32,
    pub(crate) reserved_continuation: u32,
    pub(crate) registered_continuation: u32,
}

/// Task fields only ever touched by the one thread that owns the task at a
/// given time: the handle holder, the executing worker, or the worker running
/// the completion cascade.
#[derive(Default)]
pub(crate) struct Body {
    pub(crate) func: Option<TaskFn>,
    pub(crate) payload: Payload,
    pub(crate) parent: Option<Joiner>,
    pub(crate) continuation: Option<TaskId>,
    pub(crate) affinity: Option<usize>,
    pub(crate) book: JoinBook,
}

/// A task's storage in the arena. Slot addresses never change.
pub(crate) struct TaskSlot {
    generation: AtomicU32,
    pub(crate) state: AtomicTaskState,
    pub(crate) pending: JoinCounter,
    body: UnsafeCell<Body>,
}

// Safety: the body is handed from thread to thread through the queues, the
// free lists and the join counter, all of which synchronize; a single thread
// accesses it at any time.
unsafe impl Sync for TaskSlot {}

impl TaskSlot {
    pub(crate) fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            state: AtomicTaskState::new(TaskState::Completed),
            pending: JoinCounter::new(),
            body: UnsafeCell::new(Body::default()),
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn body_ptr(&self) -> *mut Body {
        self.body.get()
    }

    /// Readies a recycled slot for a new task.
    ///
    /// # Safety
    ///
    /// The caller must own the slot: it was just taken off a free list.
    pub(crate) unsafe fn prepare(&self, func: TaskFn) {
        // Safety: exclusive ownership per the contract above.
        let body = unsafe { &mut *self.body_ptr() };
        debug_assert!(body.func.is_none() && body.parent.is_none());

        body.func = Some(func);
        self.pending.reset();
        self.state.store(TaskState::Allocated);
    }

    /// Moves an allocated task to `Queued` and gives it the reference it holds
    /// until its callable returns.
    pub(crate) fn arm(&self, id: TaskId) {
        let res = self.state.transition(TaskState::Allocated, TaskState::Queued);
        debug_assert!(
            res.is_ok(),
            "task {} spawned twice, found it {:?}",
            id,
            res.err()
        );

        self.pending.arm();
    }

    /// Drops everything the task owns and invalidates outstanding ids.
    ///
    /// # Safety
    ///
    /// The caller must own the slot: the task completed, or its handle was
    /// dropped without spawning it.
    pub(crate) unsafe fn recycle(&self) {
        // Safety: exclusive ownership per the contract above.
        let body = unsafe { &mut *self.body_ptr() };
        *body = Body::default();

        self.state.store(TaskState::Completed);
        self.generation.fetch_add(1, Ordering::Release);
    }
}
