#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables, unused_imports))
))]

//! Macros for use with microsched.

mod entry;
mod parse;

/// Runs a test against a freshly built worker pool and scheduler.
///
/// The test function is synchronous and takes the scheduler as its only
/// argument. Both the scheduler and the pool are shut down once the body
/// returns; a failing shutdown fails the test.
///
/// # Worker threads
///
/// `worker_threads` sets the number of workers, including the root slot driven
/// by the test thread itself. It defaults to `1`, so every task runs on the
/// test thread. `"hardware"` uses one worker per hardware thread.
///
/// ```no_run
/// use microsched::Scheduler;
///
/// #[microsched::test(worker_threads = 4)]
/// fn my_test(scheduler: &Scheduler) {
///     assert_eq!(scheduler.worker_count(), 4);
/// }
/// ```
///
/// Equivalent code not using `#[microsched::test]`
///
/// ```no_run
/// use microsched::Scheduler;
///
/// #[test]
/// fn my_test() {
///     let pool = microsched::pool::Builder::new()
///         .worker_threads(4)
///         .try_build()
///         .unwrap();
///     let scheduler = Scheduler::try_new(&pool).unwrap();
///
///     assert_eq!(scheduler.worker_count(), 4);
///
///     scheduler.shutdown();
///     pool.shutdown().unwrap();
/// }
/// ```
///
/// # Returning errors
///
/// The body may use `?` when the function returns a `Result`.
///
/// ```no_run
/// use microsched::Scheduler;
///
/// #[microsched::test(worker_threads = "hardware")]
/// fn my_test(scheduler: &Scheduler) -> anyhow::Result<()> {
///     assert!(scheduler.worker_count() >= 1);
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
