use crate::error::SchedulerError;
use crate::scheduler::SchedulerConfig;
use crate::task::slot::TaskSlot;
use crate::task::{TaskFn, TaskId};
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Concurrent storage for tasks, addressed by [`TaskId`].
///
/// Slots live in segments that are created lazily up to `max_segments`, so a
/// slot never moves once handed out and lookups take no lock. Freed slots go to
/// the freeing worker's local list first, then spill to a shared queue.
pub(crate) struct TaskArena {
    segment_shift: u32,
    segment_mask: usize,
    segments: Box<[OnceLock<Box<[TaskSlot]>>]>,
    capacity: usize,

    // Slots below this index have been handed out at least once.
    next_fresh: AtomicUsize,

    shared_free: SegQueue<u32>,
    local_free: Box<[CachePadded<Mutex<Vec<u32>>>]>,
    local_free_capacity: usize,
}

impl TaskArena {
    /// Expects a validated config.
    pub(crate) fn new(cfg: &SchedulerConfig, workers: usize) -> Self {
        let local_free = (0..workers)
            .map(|_| CachePadded::new(Mutex::new(Vec::with_capacity(cfg.local_free_capacity))))
            .collect();

        Self {
            segment_shift: cfg.segment_size.trailing_zeros(),
            segment_mask: cfg.segment_size - 1,
            segments: (0..cfg.max_segments).map(|_| OnceLock::new()).collect(),
            capacity: cfg.capacity(),
            next_fresh: AtomicUsize::new(0),
            shared_free: SegQueue::new(),
            local_free,
            local_free_capacity: cfg.local_free_capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of segments created so far.
    pub(crate) fn segments_in_use(&self) -> usize {
        self.segments.iter().filter(|s| s.get().is_some()).count()
    }

    /// Slots currently owned by a task. Only exact while no task is allocated
    /// or freed concurrently.
    pub(crate) fn live(&self) -> usize {
        let handed_out = self.next_fresh.load(Ordering::Acquire).min(self.capacity);
        let local = self.local_free.iter().map(|l| l.lock().len()).sum::<usize>();

        handed_out.saturating_sub(local + self.shared_free.len())
    }

    /// Allocates a task on behalf of `worker`, or of a thread outside the pool
    /// when `None`.
    pub(crate) fn allocate(
        &self,
        worker: Option<usize>,
        func: TaskFn,
    ) -> Result<TaskId, SchedulerError> {
        let index = match self.pop_free(worker) {
            Some(index) => index as usize,
            None => match self.grow() {
                Ok(index) => index,
                Err(err) => match self.steal_free(worker) {
                    Some(index) => index as usize,
                    None => {
                        tracing::warn!(capacity = self.capacity, "task arena exhausted");
                        return Err(err);
                    }
                },
            },
        };

        let slot = self.slot_at(index);

        // Safety: the index came off a free list or was never handed out.
        unsafe { slot.prepare(func) };

        Ok(TaskId::new(index as u32, slot.generation()))
    }

    fn pop_free(&self, worker: Option<usize>) -> Option<u32> {
        worker
            .and_then(|w| self.local_free[w].lock().pop())
            .or_else(|| self.shared_free.pop())
    }

    /// Slots parked on the lists of other workers, once the arena can't grow.
    fn steal_free(&self, worker: Option<usize>) -> Option<u32> {
        self.local_free
            .iter()
            .enumerate()
            .filter(|(w, _)| Some(*w) != worker)
            .find_map(|(_, local)| local.lock().pop())
    }

    fn grow(&self) -> Result<usize, SchedulerError> {
        let capacity = self.capacity;

        let index = self
            .next_fresh
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| SchedulerError::Allocation { capacity })?;

        let segment_size = self.segment_mask + 1;
        self.segments[index >> self.segment_shift].get_or_init(|| {
            tracing::debug!(segment = index >> self.segment_shift, "allocating task segment");
            (0..segment_size).map(|_| TaskSlot::new()).collect()
        });

        Ok(index)
    }

    fn slot_at(&self, index: usize) -> &TaskSlot {
        let segment = self.segments[index >> self.segment_shift]
            .get()
            .expect("task slot segment not initialized");

        &segment[index & self.segment_mask]
    }

    pub(crate) fn slot(&self, id: TaskId) -> &TaskSlot {
        let slot = self.slot_at(id.index());
        debug_assert_eq!(slot.generation(), id.generation(), "stale task id {}", id);
        slot
    }

    /// Returns the slot of a completed or discarded task to the free lists.
    ///
    /// The caller must own the task, and `id` must not be used afterwards.
    pub(crate) fn free(&self, worker: Option<usize>, id: TaskId) {
        let slot = self.slot(id);

        // Safety: ownership is guaranteed by the caller.
        unsafe { slot.recycle() };

        let index = id.index() as u32;
        let Some(worker) = worker else {
            self.shared_free.push(index);
            return;
        };

        let mut local = self.local_free[worker].lock();
        if local.len() >= self.local_free_capacity {
            // Keep half for this worker, hand the rest to everybody else.
            let spill = local.split_off(self.local_free_capacity / 2);
            spill.into_iter().for_each(|i| self.shared_free.push(i));
        }

        if self.local_free_capacity > 0 {
            local.push(index);
        } else {
            self.shared_free.push(index);
        }
    }
}

impl fmt::Debug for TaskArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskArena")
            .field("capacity", &self.capacity)
            .field("segments_in_use", &self.segments_in_use())
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}
