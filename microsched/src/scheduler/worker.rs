use crate::scheduler::Scheduler;
use crate::scheduler::context::TaskContext;
use crate::scheduler::ticker::{Ticker, TickerEvents};
use crate::task::join::Joiner;
use crate::task::{Task, TaskId, TaskState};
use crossbeam_deque::{Steal, Stealer, Worker as CbWorker};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::iter;

/// The queues of one worker index.
#[derive(Debug)]
pub(crate) struct WorkerQueues {
    /// Tasks spawned by this worker. The owner pops the newest task, peers
    /// steal the oldest through `stealer`.
    ///
    /// The lock is uncontended except on the root slot, which every waiting
    /// thread drives.
    pub(super) local: Mutex<CbWorker<TaskId>>,

    stealer: Stealer<TaskId>,

    /// Tasks routed to this worker by affinity.
    pub(super) mailbox: SegQueue<TaskId>,

    ticker: Ticker,
}

impl WorkerQueues {
    pub(super) fn new() -> Self {
        let local = CbWorker::new_lifo();

        Self {
            stealer: local.stealer(),
            local: Mutex::new(local),
            mailbox: SegQueue::new(),
            ticker: Ticker::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.stealer.is_empty() && self.mailbox.is_empty()
    }
}

impl Scheduler {
    pub(crate) fn find_task(&self, index: usize) -> Option<TaskId> {
        let shared = &*self.shared;
        let me = &shared.workers[index];
        let local = me.local.lock();

        // Enforce fairness for tasks spawned from outside the pool.
        if me.ticker.tick(&shared.cfg).contains(TickerEvents::POP_GLOBAL_QUEUE)
            && let Some(id) = shared.injector.steal_batch_and_pop(&local).success()
        {
            return Some(id);
        }

        me.mailbox
            .pop()
            .or_else(|| local.pop())
            .or_else(|| {
                iter::repeat_with(|| {
                    // Work from the injector lands in our own deque, where peers
                    // can steal it back.
                    shared
                        .injector
                        .steal_batch_and_pop(&local)
                        .or_else(|| self.steal_from_peers(index))
                })
                .take(shared.cfg.max_steal_retries)
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
            })
            .or_else(|| self.steal_from_mailboxes(index))
    }

    /// Peers in round-robin order, starting at a random one.
    fn peers(&self, index: usize) -> impl Iterator<Item = usize> {
        let n = self.shared.workers.len();
        let start = fastrand::usize(..n);

        (0..n).map(move |i| (start + i) % n).filter(move |&j| j != index)
    }

    fn steal_from_peers(&self, index: usize) -> Steal<TaskId> {
        // Collect stops at the first success.
        self.peers(index)
            .map(|j| self.shared.workers[j].stealer.steal())
            .collect()
    }

    fn steal_from_mailboxes(&self, index: usize) -> Option<TaskId> {
        self.peers(index)
            .find_map(|j| self.shared.workers[j].mailbox.pop())
    }

    /// Whether any queue holds a task. Every worker looks at every queue
    /// eventually, so this is also the wake condition of idle workers.
    pub(super) fn has_any_work(&self) -> bool {
        !self.shared.injector.is_empty() || self.shared.workers.iter().any(|w| !w.is_empty())
    }

    /// Runs `id` and every task it hands over for immediate execution.
    pub(crate) fn execute(&self, index: usize, id: TaskId) {
        let mut next = Some(id);

        while let Some(id) = next {
            next = self.run_task(index, id);
        }
    }

    fn run_task(&self, index: usize, id: TaskId) -> Option<TaskId> {
        let slot = self.arena().slot(id);

        let res = slot.state.transition(TaskState::Queued, TaskState::Running);
        debug_assert!(res.is_ok(), "task {} executed while {:?}", id, res.err());

        let ctx = TaskContext::new(index, self);

        let next = {
            // Safety: dequeuing the task made this worker its owner.
            let mut task = unsafe { Task::from_raw(id, self) };
            let func = task.callable();
            func(&mut task, &ctx)
        };

        // Armed before this task returns, so the bypassed task holds its own
        // reference before any join it belongs to can be released.
        let next = next.map(|handle| {
            debug_assert!(
                handle.scheduler().ptr_eq(self),
                "task {} returned a task of another scheduler",
                id
            );

            let next = handle.into_raw();
            self.arena().slot(next).arm(next);
            next
        });

        self.on_return(index, id);
        next
    }

    /// Admits a continuation nobody else will admit, then drops the reference
    /// the task held on itself while running.
    fn on_return(&self, index: usize, id: TaskId) {
        let slot = self.arena().slot(id);

        let (continuation, book) = {
            // Safety: the task is owned until its own reference is released.
            let body = unsafe { &*slot.body_ptr() };
            (body.continuation, body.book)
        };

        debug_assert_eq!(
            book.reserved_self, book.registered_self,
            "task {} returned before registering every child it reserved",
            id
        );
        debug_assert_eq!(
            book.reserved_continuation, book.registered_continuation,
            "task {} returned before registering every child of its continuation",
            id
        );

        // With children reserved, the continuation may already be running.
        if let Some(continuation) = continuation
            && book.reserved_continuation == 0
        {
            self.admit(index, continuation);
        }

        if slot.pending.release() {
            self.complete(index, id);
        }
    }

    /// Queues a continuation whose join counter reached zero.
    fn admit(&self, index: usize, id: TaskId) {
        let slot = self.arena().slot(id);
        slot.arm(id);

        // Safety: the zero transition made this thread the owner.
        let affinity = unsafe { (*slot.body_ptr()).affinity };
        self.enqueue(Some(index), id, affinity);
    }

    /// Completes `id` and every joiner it was the last outstanding child of.
    fn complete(&self, index: usize, mut id: TaskId) {
        loop {
            let slot = self.arena().slot(id);

            // Safety: the zero transition made this thread the owner.
            let parent = unsafe { (*slot.body_ptr()).parent.take() };
            self.arena().free(Some(index), id);

            let parent = match parent {
                None => return,
                Some(Joiner::Latch(latch)) => {
                    latch.release();
                    return;
                }
                Some(Joiner::Task(parent)) => parent,
            };

            let parent_slot = self.arena().slot(parent);
            if !parent_slot.pending.release() {
                return;
            }

            match parent_slot.state.load() {
                // A continuation.
                TaskState::Allocated => {
                    self.admit(index, parent);
                    return;
                }
                // Joining its own children, and it already returned.
                TaskState::Running => id = parent,
                state => {
                    debug_assert!(false, "task {} released while {:?}", parent, state);
                    return;
                }
            }
        }
    }
}
