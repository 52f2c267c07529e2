//! The worker pool owns the threads that execute tasks.
//!
//! It knows nothing about tasks: schedulers register themselves as an
//! [`EventLoop`] and pool threads keep calling into every registered loop until
//! the pool shuts down. Threads with nothing to run spin for a while, then park
//! on [`Sleepers`] until a scheduler publishes more work.

use crate::error::PoolError;
use crate::utils;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

mod builder;
pub use builder::Builder;
pub(crate) use builder::PoolConfig;

mod idle;
pub(crate) use idle::{IdleAction, TieredIdle};

mod sleepers;
pub(crate) use sleepers::Sleepers;


/// Lifecycle of a [`WorkerPool`]. Transitions only go forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Running,
    ShuttingDown,
    Shutdown,
}

/// A source of work driven by the pool threads.
pub(crate) trait EventLoop: Send + Sync + 'static {
    /// Finds and executes at most one unit of work on behalf of `worker_index`.
    /// Returns whether anything ran.
    fn run_once(&self, worker_index: usize) -> bool;

    /// Whether `worker_index` could find work right now.
    fn has_work(&self, worker_index: usize) -> bool;
}

#[derive(Clone)]
struct Registration {
    id: u64,
    event_loop: Arc<dyn EventLoop>,
}

/// State shared between the pool, its threads, and bound schedulers.
pub(crate) struct Shared {
    thread_count: usize,
    spin_iters: u32,
    park_timeout: Duration,

    shutdown: AtomicBool,
    pub(crate) sleepers: Sleepers,

    registry: RwLock<Vec<Registration>>,

    // Bumped on every registry change so threads know to refresh their copy.
    generation: AtomicU64,
    next_registration_id: AtomicU64,

    panicked: AtomicUsize,
}

impl Shared {
    fn new(thread_count: usize, cfg: &PoolConfig) -> Self {
        Self {
            thread_count,
            spin_iters: cfg.spin_iters,
            park_timeout: cfg.park_timeout,
            shutdown: AtomicBool::new(false),
            sleepers: Sleepers::new(),
            registry: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            next_registration_id: AtomicU64::new(0),
            panicked: AtomicUsize::new(0),
        }
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub(crate) fn spin_iters(&self) -> u32 {
        self.spin_iters
    }

    pub(crate) fn park_timeout(&self) -> Duration {
        self.park_timeout
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Binds an event loop to the pool threads. Returns the id to unregister it.
    pub(crate) fn register(&self, event_loop: Arc<dyn EventLoop>) -> u64 {
        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);

        self.registry.write().push(Registration { id, event_loop });
        self.generation.fetch_add(1, Ordering::Release);

        // Parked threads hold a stale registry copy.
        self.sleepers.notify_all();
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        let removed = {
            let mut registry = self.registry.write();
            let len = registry.len();
            registry.retain(|r| r.id != id);
            registry.len() != len
        };

        if removed {
            self.generation.fetch_add(1, Ordering::Release);
            self.sleepers.notify_all();
        }
    }

    fn snapshot(&self) -> (u64, Vec<Arc<dyn EventLoop>>) {
        let registry = self.registry.read();
        let generation = self.generation.load(Ordering::Acquire);
        let loops = registry.iter().map(|r| Arc::clone(&r.event_loop)).collect();
        (generation, loops)
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.sleepers.notify_all();
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("thread_count", &self.thread_count)
            .field("shutdown", &self.is_shutdown())
            .field("registered", &self.registry.read().len())
            .field("num_parked", &self.sleepers.num_parked())
            .finish_non_exhaustive()
    }
}

/// Loop run by every pool thread.
fn run_worker(shared: &Shared, index: usize) {
    let (mut generation, mut loops) = shared.snapshot();
    let mut idle = TieredIdle::new(shared.spin_iters);

    while !shared.is_shutdown() {
        if shared.generation.load(Ordering::Acquire) != generation {
            (generation, loops) = shared.snapshot();
        }

        if loops.iter().any(|l| l.run_once(index)) {
            idle.on_work();
            continue;
        }

        if idle.on_idle() == IdleAction::Continue {
            continue;
        }

        shared.sleepers.park(
            || {
                shared.is_shutdown()
                    || shared.generation.load(Ordering::Acquire) != generation
                    || loops.iter().any(|l| l.has_work(index))
            },
            shared.park_timeout,
        );
        idle.on_work();
    }

    // Drain whatever is still reachable before exiting.
    while loops.iter().any(|l| l.run_once(index)) {}
}

#[derive(Debug)]
struct Lifecycle {
    state: PoolState,
    shared: Option<Arc<Shared>>,
    handles: Vec<JoinHandle<()>>,
}

/// A fixed-size set of worker threads.
///
/// Each worker has a stable index in `[0, thread_count)`. Index `0` is the root
/// slot: it has no pool thread and is driven by whichever thread waits on a
/// task graph. The pool starts `thread_count - 1` threads for the others.
#[derive(Debug)]
pub struct WorkerPool {
    cfg: PoolConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    /// Creates an uninitialized pool with the default configuration.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Returns a [`Builder`] to configure thread names, stack size and idling.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn with_config(cfg: PoolConfig) -> Self {
        Self {
            cfg,
            lifecycle: Mutex::new(Lifecycle {
                state: PoolState::Uninitialized,
                shared: None,
                handles: Vec::new(),
            }),
        }
    }

    /// Concurrency hint from the platform, used as the default worker count.
    /// Never changes during the lifetime of the process.
    pub fn hardware_thread_count() -> usize {
        utils::thread::hardware_thread_count()
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle.lock().state
    }

    /// Number of workers, including the root slot. Zero until initialized.
    pub fn thread_count(&self) -> usize {
        self.lifecycle
            .lock()
            .shared
            .as_ref()
            .map_or(0, |s| s.thread_count)
    }

    pub(crate) fn shared(&self) -> Option<Arc<Shared>> {
        let lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            PoolState::Running => lifecycle.shared.clone(),
            _ => None,
        }
    }

    /// Creates `thread_count` workers and starts the threads backing workers
    /// `1..thread_count`.
    ///
    /// If the platform refuses to create a thread, the threads already started
    /// are stopped and joined, and the pool moves to [`PoolState::Shutdown`].
    pub fn initialize(&self, thread_count: usize) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle.lock();

        if lifecycle.state != PoolState::Uninitialized {
            return Err(PoolError::AlreadyInitialized);
        }

        self.cfg
            .validate(thread_count)
            .map_err(PoolError::InvalidConfig)?;

        let shared = Arc::new(Shared::new(thread_count, &self.cfg));
        let mut handles = Vec::with_capacity(thread_count.saturating_sub(1));

        for index in 1..thread_count {
            match self.spawn_worker_thread(&shared, index) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    tracing::error!(index, error = %source, "failed to spawn worker thread");

                    shared.begin_shutdown();
                    join_all(handles);
                    lifecycle.state = PoolState::Shutdown;

                    return Err(PoolError::ThreadCreation { index, source });
                }
            }
        }

        tracing::debug!(thread_count, "worker pool initialized");

        lifecycle.state = PoolState::Running;
        lifecycle.shared = Some(shared);
        lifecycle.handles = handles;
        Ok(())
    }

    fn spawn_worker_thread(
        &self,
        shared: &Arc<Shared>,
        index: usize,
    ) -> std::io::Result<JoinHandle<()>> {
        #[cfg(test)]
        if self.cfg.fail_spawn_at == Some(index) {
            return Err(std::io::Error::other("injected thread spawn failure"));
        }

        let mut builder = thread::Builder::new().name((self.cfg.thread_name.0)(index));

        if let Some(stack_size) = self.cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = Arc::clone(shared);
        builder.spawn(move || {
            let res = panic::catch_unwind(AssertUnwindSafe(|| run_worker(&shared, index)));

            if res.is_err() {
                tracing::error!(index, "worker thread panicked");
                shared.panicked.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    /// Signals every worker thread to exit once it has drained the work it can
    /// reach, then joins them.
    ///
    /// A no-op on a pool that is not running, so calling it twice is safe.
    pub fn shutdown(&self) -> Result<(), PoolError> {
        let (shared, handles) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != PoolState::Running {
                return Ok(());
            }

            lifecycle.state = PoolState::ShuttingDown;
            let Some(shared) = lifecycle.shared.clone() else {
                lifecycle.state = PoolState::Shutdown;
                return Ok(());
            };

            (shared, std::mem::take(&mut lifecycle.handles))
        };

        shared.begin_shutdown();
        let join_errors = join_all(handles);

        // Breaks the reference cycle between the pool and bound schedulers.
        shared.registry.write().clear();

        self.lifecycle.lock().state = PoolState::Shutdown;
        tracing::debug!(thread_count = shared.thread_count, "worker pool shut down");

        match shared.panicked.swap(0, Ordering::Relaxed) + join_errors {
            0 => Ok(()),
            n => Err(PoolError::WorkerPanicked(n)),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "error during worker pool shutdown");
        }
    }
}

/// Joins every handle, returns how many threads panicked.
fn join_all(handles: Vec<JoinHandle<()>>) -> usize {
    handles
        .into_iter()
        .filter_map(|handle| handle.join().err())
        .count()
}
