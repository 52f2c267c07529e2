#[cfg(test)]
use anyhow::{Result, anyhow};
use std::sync::OnceLock;
use std::thread;

/// Number of hardware threads reported by the platform, or 1 if it can't tell.
///
/// The value is sampled once and cached, so it never changes for the lifetime
/// of the process.
pub(crate) fn hardware_thread_count() -> usize {
    static HARDWARE_THREADS: OnceLock<usize> = OnceLock::new();

    *HARDWARE_THREADS.get_or_init(|| match thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            tracing::warn!(error = %e, "unable to query available parallelism, assuming 1");
            1
        }
    })
}

/// Gets the name of the current thread.
#[cfg(test)]
pub(crate) fn get_current_thread_name() -> Result<String> {
    thread::current()
        .name()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("current thread {:?} is unnamed", thread::current().id()))
}
