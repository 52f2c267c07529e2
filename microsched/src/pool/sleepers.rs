use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkOutcome {
    /// The wake condition already held, the thread never went to sleep.
    Skipped,

    /// Another thread handed us a wakeup.
    Notified,

    /// Woke up on our own: the wake condition became true, the park timed out,
    /// or the wakeup was spurious.
    Woken,
}

#[derive(Debug)]
struct Sleeper {
    thread: Thread,
    notified: Arc<AtomicBool>,
}

/// Threads parked because they found no work.
///
/// Producers publish work *then* call [`Sleepers::notify_one`]; consumers
/// announce themselves *then* re-check their wake condition. Both sides issue a
/// `SeqCst` fence between the two steps, so at least one of them observes the
/// other and a wakeup can't be lost.
#[derive(Debug, Default)]
pub(crate) struct Sleepers {
    parked: Mutex<VecDeque<Sleeper>>,
    num_parked: AtomicUsize,
}

impl Sleepers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::SeqCst)
    }

    /// Parks the current thread until notified, until `wake_condition` holds,
    /// or until `timeout` elapses.
    ///
    /// `wake_condition` is evaluated under the sleepers lock before the thread
    /// goes to sleep, and again after every wakeup.
    pub(crate) fn park<F>(&self, wake_condition: F, timeout: Duration) -> ParkOutcome
    where
        F: Fn() -> bool,
    {
        let notified = Arc::new(AtomicBool::new(false));

        {
            let mut parked = self.parked.lock();

            self.num_parked.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            if wake_condition() {
                self.num_parked.fetch_sub(1, Ordering::SeqCst);
                return ParkOutcome::Skipped;
            }

            parked.push_back(Sleeper {
                thread: thread::current(),
                notified: Arc::clone(&notified),
            });
        }

        tracing::trace!(thread = ?thread::current().id(), "parking");

        let deadline = Instant::now() + timeout;
        loop {
            if notified.load(Ordering::Acquire) {
                return ParkOutcome::Notified;
            }

            if wake_condition() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            thread::park_timeout(deadline - now);
        }

        // Leaving without a notification: remove ourselves from the queue. If a
        // notifier already popped us, the wakeup it meant for a sleeping thread
        // was consumed here, so pass it on.
        let removed = {
            let mut parked = self.parked.lock();
            match parked
                .iter()
                .position(|s| Arc::ptr_eq(&s.notified, &notified))
            {
                Some(pos) => {
                    parked.remove(pos);
                    self.num_parked.fetch_sub(1, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };

        if removed {
            ParkOutcome::Woken
        } else {
            self.notify_one();
            ParkOutcome::Notified
        }
    }

    /// Wakes up the most recently parked thread, if any. Returns whether a
    /// thread was notified.
    pub(crate) fn notify_one(&self) -> bool {
        fence(Ordering::SeqCst);

        if self.num_parked.load(Ordering::SeqCst) == 0 {
            return false;
        }

        let sleeper = {
            let mut parked = self.parked.lock();
            let sleeper = parked.pop_back();
            if sleeper.is_some() {
                self.num_parked.fetch_sub(1, Ordering::SeqCst);
            }
            sleeper
        };

        match sleeper {
            Some(sleeper) => {
                Self::wake(sleeper);
                true
            }
            None => false,
        }
    }

    /// Wakes up every parked thread. Returns how many were notified.
    pub(crate) fn notify_all(&self) -> usize {
        fence(Ordering::SeqCst);

        let sleepers = {
            let mut parked = self.parked.lock();
            self.num_parked.fetch_sub(parked.len(), Ordering::SeqCst);
            parked.drain(..).collect::<Vec<_>>()
        };

        let n = sleepers.len();
        sleepers.into_iter().for_each(Self::wake);
        n
    }

    fn wake(sleeper: Sleeper) {
        tracing::trace!(thread = ?sleeper.thread.id(), "unparking");

        sleeper.notified.store(true, Ordering::Release);
        sleeper.thread.unpark();
    }
}
