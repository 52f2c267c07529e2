use std::hint;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleAction {
    /// Look for work again right away.
    Continue,

    /// Spinning is exhausted, park until woken up.
    Park,
}

/// Spin, then yield, then park.
#[derive(Debug)]
pub(crate) struct TieredIdle {
    idle_rounds: u32,
    spin_iters: u32,
}

impl TieredIdle {
    pub(crate) fn new(spin_iters: u32) -> Self {
        Self {
            idle_rounds: 0,
            spin_iters,
        }
    }

    pub(crate) fn on_work(&mut self) {
        self.idle_rounds = 0;
    }

    pub(crate) fn on_idle(&mut self) -> IdleAction {
        self.idle_rounds = self.idle_rounds.saturating_add(1);

        if self.idle_rounds > self.spin_iters {
            return IdleAction::Park;
        }

        if (self.idle_rounds & 0xF) == 0 {
            thread::yield_now();
        } else {
            hint::spin_loop();
        }

        IdleAction::Continue
    }
}
