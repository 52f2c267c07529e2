use crate::scheduler::SchedulerConfig;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

/// Counts the find attempts of one worker slot.
///
/// The root slot is shared by every thread waiting on a graph, so the tick is
/// atomic; losing the exact interval under contention is harmless.
#[derive(Debug, Default)]
pub(crate) struct Ticker {
    tick: AtomicU32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tick(&self, cfg: &SchedulerConfig) -> TickerEvents {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let mut events = TickerEvents::empty();

        if tick.is_multiple_of(cfg.global_queue_interval) {
            events.insert(TickerEvents::POP_GLOBAL_QUEUE);
        }

        events
    }
}

bitflags! {
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u8 {
        /// Check the global queue before the local queues.
        const POP_GLOBAL_QUEUE = 1;
    }
}
