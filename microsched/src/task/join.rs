use crate::task::TaskId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
use std::thread::{self, Thread};

/// Outstanding completions a task waits on before it may run (continuations)
/// or complete (tasks joining their own children).
///
/// The zero transition is the synchronization point of the task graph: every
/// decrement is a release, and the thread observing zero issues an acquire
/// fence, so it sees all memory effects of the completed children.
#[derive(Debug)]
pub(crate) struct JoinCounter(AtomicU32);

impl JoinCounter {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the counter to the single reference held by a task while it is
    /// queued or running. Only called by the thread that owns the task.
    pub(crate) fn arm(&self) {
        self.0.store(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Adds `n` pending completions. Must happen before the children that
    /// release them are spawned; publishing the children orders it.
    pub(crate) fn reserve(&self, n: u32) {
        let prev = self.0.fetch_add(n, Ordering::Relaxed);
        debug_assert!(prev.checked_add(n).is_some(), "join counter overflow");
    }

    /// Releases one pending completion. Returns true for the caller that
    /// brought the counter to zero.
    #[must_use]
    pub(crate) fn release(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0, "join counter underflow");

        if prev != 1 {
            return false;
        }

        fence(Ordering::Acquire);
        true
    }
}

/// Whom a task notifies when it completes.
#[derive(Debug)]
pub(crate) enum Joiner {
    /// A continuation, or a task joining its own children.
    Task(TaskId),

    /// A thread blocked in `spawn_task_and_wait`.
    Latch(Arc<WaitLatch>),
}

/// Completion flag for the root of an awaited graph.
#[derive(Debug)]
pub(crate) struct WaitLatch {
    done: AtomicBool,
    waiter: Thread,
}

impl WaitLatch {
    /// A latch waking up the current thread.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            waiter: thread::current(),
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        self.done.store(true, Ordering::Release);
        self.waiter.unpark();
    }
}
