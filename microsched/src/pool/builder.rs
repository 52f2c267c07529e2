use crate::error::PoolError;
use crate::pool::WorkerPool;
use crate::utils::thread::hardware_thread_count;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Idle rounds a worker spins through before it parks.
const SPIN_ITERS: u32 = 64;

/// Upper bound on a single park. Wakeups never depend on it, it only bounds the
/// latency of a worker noticing work it was not notified about.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Upper bound on the number of workers in a pool.
pub(crate) const MAX_THREADS: usize = u16::MAX as usize;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|index| format!("microsched-{}", index)))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`WorkerPool`].
///
/// ```
/// use microsched::pool::Builder;
///
/// let pool = Builder::new()
///     .worker_threads(4)
///     .thread_name("fork-join")
///     .try_build()
///     .unwrap();
///
/// assert_eq!(pool.thread_count(), 4);
/// pool.shutdown().unwrap();
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Total number of workers, including the root slot driven by threads that
    /// wait on a graph. Defaults to one per hardware thread.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the pool, called with the worker index.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the pool.
    thread_stack_size: Option<usize>,

    /// Idle rounds spent spinning before a worker parks.
    spin_iters: u32,

    /// Maximum duration of a single park.
    park_timeout: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            spin_iters: SPIN_ITERS,
            park_timeout: PARK_TIMEOUT,
        }
    }

    /// The number of workers in the pool, used by [`Builder::try_build`].
    ///
    /// Worker `0` is not backed by a pool thread: it is the slot used by the
    /// thread calling `spawn_task_and_wait`. The pool spawns `val - 1` threads.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the prefix of worker thread names. Threads are named
    /// "{prefix}-{index}", the default prefix is "microsched".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let prefix = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |index| format!("{}-{}", prefix, index)));
        self
    }

    /// Sets a function used to name worker threads, called with the worker index.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Number of idle rounds a worker spins through before it parks. Zero parks
    /// as soon as no work is found.
    pub fn spin_iters(mut self, val: u32) -> Self {
        self.spin_iters = val;
        self
    }

    #[track_caller]
    pub fn park_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "park_timeout must be greater than 0");
        self.park_timeout = val;
        self
    }

    /// Creates an uninitialized pool carrying this configuration. The worker
    /// count is given later to [`WorkerPool::initialize`].
    pub fn build(self) -> WorkerPool {
        WorkerPool::with_config(self.into())
    }

    /// Creates the pool and starts its worker threads.
    pub fn try_build(self) -> Result<WorkerPool, PoolError> {
        let thread_count = self.worker_threads.unwrap_or_else(hardware_thread_count);

        let pool = self.build();
        pool.initialize(thread_count)?;

        Ok(pool)
    }
}

/// Builder settings consumed by the pool and its worker threads.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) spin_iters: u32,
    pub(crate) park_timeout: Duration,

    /// Fails the spawn of the worker with this index.
    #[cfg(test)]
    pub(crate) fail_spawn_at: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Builder::new().into()
    }
}

impl From<Builder> for PoolConfig {
    fn from(builder: Builder) -> Self {
        PoolConfig {
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            spin_iters: builder.spin_iters,
            park_timeout: builder.park_timeout,
            #[cfg(test)]
            fail_spawn_at: None,
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self, thread_count: usize) -> Result<()> {
        if thread_count == 0 {
            return Err(anyhow!("thread_count must be at least 1"));
        }

        if thread_count > MAX_THREADS {
            return Err(anyhow!(
                "thread_count {} exceeds the maximum of {}",
                thread_count,
                MAX_THREADS
            ));
        }

        if self.park_timeout.is_zero() {
            return Err(anyhow!("park_timeout must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    // Cloned into every worker thread.
    assert_impl_all!(PoolConfig: Send, Sync, Clone);

    #[rstest]
    #[case::zero(0, false)]
    #[case::one(1, true)]
    #[case::many(64, true)]
    #[case::too_many(MAX_THREADS + 1, false)]
    fn test_validate_thread_count(#[case] thread_count: usize, #[case] valid: bool) {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.validate(thread_count).is_ok(), valid);
    }

    #[test]
    fn test_thread_name_prefix() {
        let cfg: PoolConfig = Builder::new().thread_name("fj").into();
        assert_eq!((cfg.thread_name.0)(3), "fj-3");

        let cfg = PoolConfig::default();
        assert_eq!((cfg.thread_name.0)(0), "microsched-0");
    }

    #[test]
    #[should_panic(expected = "worker_threads must be greater than 0")]
    fn test_zero_worker_threads_panics() {
        let _ = Builder::new().worker_threads(0);
    }

    #[test]
    #[should_panic(expected = "thread_stack_size must be a power of two")]
    fn test_stack_size_power_of_two() {
        let _ = Builder::new().thread_stack_size(3 * 1024);
    }
}
