use crate::scheduler::{Scheduler, TaskContext};
use crate::task::join::Joiner;
use crate::task::slot::{Body, JoinBook, TaskSlot};
use crate::task::{TaskId, TaskState};
use std::fmt;
use std::mem;
use std::thread;

/// The callable of a task.
///
/// It receives the running task and the context of the worker executing it. A
/// returned handle is executed right away on the same worker, bypassing the
/// queues.
pub type TaskFn = for<'s> fn(&mut Task<'s>, &TaskContext<'s>) -> Option<TaskHandle<'s>>;

/// An allocated task that has not been spawned yet.
///
/// The handle owns the task: it can attach data and an affinity, be installed as
/// a continuation, be registered as a child, and finally be spawned. Dropping it
/// discards the task.
#[must_use = "dropping a TaskHandle discards the task"]
pub struct TaskHandle<'s> {
    id: TaskId,
    scheduler: &'s Scheduler,
}

impl<'s> TaskHandle<'s> {
    pub(crate) fn new(id: TaskId, scheduler: &'s Scheduler) -> Self {
        Self { id, scheduler }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.slot().state.load()
    }

    fn slot(&self) -> &'s TaskSlot {
        self.scheduler.arena().slot(self.id)
    }

    pub(crate) fn scheduler(&self) -> &'s Scheduler {
        self.scheduler
    }

    pub(crate) fn body(&self) -> &Body {
        // Safety: the handle owns the unspawned task.
        unsafe { &*self.slot().body_ptr() }
    }

    pub(crate) fn body_mut(&mut self) -> &mut Body {
        // Safety: the handle owns the unspawned task, and `&mut self` makes the
        // borrow unique.
        unsafe { &mut *self.slot().body_ptr() }
    }

    /// Stores `value` in the task payload, replacing any previous value. Small
    /// values live inline in the task slot.
    pub fn set_data<T: Send + 'static>(&mut self, value: T) {
        self.body_mut().payload.set(value);
    }

    pub fn with_data<T: Send + 'static>(mut self, value: T) -> Self {
        self.set_data(value);
        self
    }

    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.body().payload.get()
    }

    pub fn data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.body_mut().payload.get_mut()
    }

    /// Routes the task to `worker` when it is spawned or admitted. A starved
    /// worker may still steal it.
    #[track_caller]
    pub fn set_affinity(&mut self, worker: usize) {
        let count = self.scheduler.worker_count();
        assert!(
            worker < count,
            "affinity {} out of range for {} workers",
            worker,
            count
        );

        self.body_mut().affinity = Some(worker);
    }

    pub fn affinity(&self) -> Option<usize> {
        self.body().affinity
    }

    /// Gives up ownership without discarding the task.
    pub(crate) fn into_raw(self) -> TaskId {
        let id = self.id;
        mem::forget(self);
        id
    }
}

impl Drop for TaskHandle<'_> {
    fn drop(&mut self) {
        // Its joiner would wait forever. Skipped while unwinding from another
        // assertion so the first panic is the one reported.
        debug_assert!(
            thread::panicking() || self.body().parent.is_none(),
            "task {} registered as a child was dropped without being spawned",
            self.id
        );

        tracing::trace!(task = %self.id, "discarding unspawned task");
        self.scheduler.arena().free(None, self.id);
    }
}

impl fmt::Debug for TaskHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("affinity", &self.affinity())
            .finish_non_exhaustive()
    }
}

/// A task whose callable is executing.
pub struct Task<'s> {
    id: TaskId,
    slot: &'s TaskSlot,
    body: &'s mut Body,
    scheduler: &'s Scheduler,
}

impl<'s> Task<'s> {
    /// # Safety
    ///
    /// The calling worker must own the running task for `'s`.
    pub(crate) unsafe fn from_raw(id: TaskId, scheduler: &'s Scheduler) -> Self {
        let slot = scheduler.arena().slot(id);

        Self {
            id,
            slot,
            // Safety: see the function contract.
            body: unsafe { &mut *slot.body_ptr() },
            scheduler,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn callable(&self) -> TaskFn {
        self.body
            .func
            .expect("running task has no callable")
    }

    pub fn affinity(&self) -> Option<usize> {
        self.body.affinity
    }

    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.body.payload.get()
    }

    pub fn data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.body.payload.get_mut()
    }

    /// Moves the payload out if it holds a `T`.
    pub fn take_data<T: 'static>(&mut self) -> Option<T> {
        self.body.payload.take()
    }

    pub fn set_data<T: Send + 'static>(&mut self, value: T) {
        self.body.payload.set(value);
    }

    /// Installs `continuation` to run once every child registered on it has
    /// completed, and hands it whatever this task was joined to.
    ///
    /// Must be called at most once, before any reservation on this task. If the
    /// task returns without reserving children on the continuation, the
    /// continuation is admitted at that point.
    ///
    /// Once the children are spawned, this task is orphaned: the graph may
    /// complete, and a waiting thread may return, before the callable does. Any
    /// effect the rest of the graph depends on must happen before spawning.
    pub fn set_continuation(&mut self, continuation: TaskHandle<'s>) -> Continuation<'_> {
        debug_assert!(
            continuation.scheduler().ptr_eq(self.scheduler),
            "continuation {} belongs to another scheduler",
            continuation.id()
        );
        debug_assert!(
            self.body.continuation.is_none(),
            "task {} already has a continuation",
            self.id
        );
        debug_assert!(
            self.body.book.reserved_self == 0 && self.body.book.registered_self == 0,
            "continuation installed on task {} after children were reserved on it",
            self.id
        );

        let mut continuation = continuation;
        debug_assert!(
            continuation.body().parent.is_none(),
            "continuation {} is already registered as a child",
            continuation.id()
        );
        continuation.body_mut().parent = self.body.parent.take();

        let id = continuation.into_raw();
        self.body.continuation = Some(id);

        Continuation {
            id,
            slot: self.scheduler.arena().slot(id),
            book: &mut self.body.book,
            scheduler: self.scheduler,
        }
    }

    /// The continuation installed by [`Task::set_continuation`], to register
    /// more children on it.
    pub fn continuation(&mut self) -> Option<Continuation<'_>> {
        let id = self.body.continuation?;

        Some(Continuation {
            id,
            slot: self.scheduler.arena().slot(id),
            book: &mut self.body.book,
            scheduler: self.scheduler,
        })
    }

    /// Makes this task wait for `n` more children before it completes, without
    /// using a continuation. Not allowed once a continuation is installed.
    #[track_caller]
    pub fn reserve(&mut self, n: u32) {
        debug_assert!(
            self.body.continuation.is_none(),
            "task {} reserved children on itself after installing a continuation",
            self.id
        );

        self.slot.pending.reserve(n);
        self.body.book.reserved_self += n;
    }

    /// Registers `child` to release this task when it completes.
    #[track_caller]
    pub fn add_child(&mut self, child: &mut TaskHandle<'s>) {
        debug_assert!(
            self.body.continuation.is_none(),
            "task {} registered a child on itself after installing a continuation",
            self.id
        );

        let book = &mut self.body.book;
        book.registered_self += 1;
        debug_assert!(
            book.registered_self <= book.reserved_self,
            "task {} registered more children than it reserved",
            self.id
        );

        link_child(self.id, self.scheduler, child);
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("continuation", &self.body.continuation)
            .field("book", &self.body.book)
            .finish_non_exhaustive()
    }
}

/// The continuation of a running task, used to reserve and register the
/// children it joins.
///
/// The continuation may be admitted, run, and be recycled as soon as its last
/// reserved child completes, so reserve everything before spawning.
pub struct Continuation<'a> {
    id: TaskId,
    slot: &'a TaskSlot,
    book: &'a mut JoinBook,
    scheduler: &'a Scheduler,
}

impl Continuation<'_> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn reserve(&mut self, n: u32) {
        debug_assert!(
            self.slot.generation() == self.id.generation()
                && self.slot.state.load() == TaskState::Allocated,
            "reserve on continuation {} after it was admitted",
            self.id
        );

        self.slot.pending.reserve(n);
        self.book.reserved_continuation += n;
    }

    #[track_caller]
    pub fn add_child(&mut self, child: &mut TaskHandle<'_>) {
        self.book.registered_continuation += 1;
        debug_assert!(
            self.book.registered_continuation <= self.book.reserved_continuation,
            "continuation {} registered more children than it reserved",
            self.id
        );

        link_child(self.id, self.scheduler, child);
    }
}

impl fmt::Debug for Continuation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.id)
            .field("reserved", &self.book.reserved_continuation)
            .field("registered", &self.book.registered_continuation)
            .finish()
    }
}

fn link_child(parent: TaskId, scheduler: &Scheduler, child: &mut TaskHandle<'_>) {
    let id = child.id();
    debug_assert!(
        child.scheduler().ptr_eq(scheduler),
        "child {} belongs to another scheduler",
        id
    );

    let body = child.body_mut();
    debug_assert!(
        body.parent.is_none(),
        "task {} is already registered as a child",
        id
    );

    body.parent = Some(Joiner::Task(parent));
}
