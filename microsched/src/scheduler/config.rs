use anyhow::{Result, anyhow};

/// Task slots per arena segment.
const SEGMENT_SIZE: usize = 1024;

/// Segments the arena may grow to.
const MAX_SEGMENTS: usize = 1024;

/// Recycled slots a worker keeps for itself before sharing them.
const LOCAL_FREE_CAPACITY: usize = 256;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Tuning of a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Task slots per arena segment. Must be a power of two.
    pub segment_size: usize,

    /// Segments the task arena may create. Segments are created on demand and
    /// never freed while the scheduler lives; once all of them are full,
    /// allocation fails with [`SchedulerError::Allocation`](crate::SchedulerError::Allocation).
    pub max_segments: usize,

    /// Slots each worker keeps on its own free list. Half of the list spills to
    /// a shared queue when it is full.
    pub local_free_capacity: usize,

    /// Rounds of stealing from the global queue and peers before giving up.
    pub max_steal_retries: usize,

    /// Number of ticks after which a worker checks the global queue before its
    /// own. Smaller values favor work spawned from outside the pool.
    pub global_queue_interval: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            segment_size: SEGMENT_SIZE,
            max_segments: MAX_SEGMENTS,
            local_free_capacity: LOCAL_FREE_CAPACITY,
            max_steal_retries: MAX_STEAL_RETRIES,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
        }
    }
}

impl SchedulerConfig {
    /// Total number of tasks that can be alive at once.
    pub fn capacity(&self) -> usize {
        self.segment_size.saturating_mul(self.max_segments)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.segment_size.is_power_of_two() {
            return Err(anyhow!(
                "segment_size must be a power of two, got {}",
                self.segment_size
            ));
        }

        if self.max_segments == 0 {
            return Err(anyhow!("max_segments must be greater than 0"));
        }

        // Task ids address slots with a u32.
        if self.capacity() > u32::MAX as usize {
            return Err(anyhow!(
                "arena capacity {} exceeds the maximum of {}",
                self.capacity(),
                u32::MAX
            ));
        }

        if self.max_steal_retries == 0 {
            return Err(anyhow!("max_steal_retries must be greater than 0"));
        }

        if self.global_queue_interval == 0 {
            return Err(anyhow!("global_queue_interval must be greater than 0"));
        }

        Ok(())
    }
}
