use super::*;
use crate as microsched;
use crate::pool::Builder;
use crate::task::{Task, TaskState};
use crate::test_utils::*;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::AtomicUsize;
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Scheduler: Send, Sync, Clone);
assert_impl_all!(TaskContext<'static>: Send, Sync, Copy);
assert_impl_all!(TaskHandle<'static>: Send);
assert_impl_all!(TaskId: Send, Sync, Copy);

const DEADLINE: Duration = Duration::from_secs(30);

fn wait_for(what: &str, cond: impl Fn() -> bool) -> Result<()> {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > DEADLINE {
            return Err(anyhow!("timed out waiting for {}", what));
        }
        thread::yield_now();
    }
    Ok(())
}

fn noop<'s>(_: &mut Task<'s>, _: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    None
}

fn count_hit<'s>(task: &mut Task<'s>, _: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    if let Some(hits) = task.data::<Arc<AtomicUsize>>() {
        hits.fetch_add(1, Ordering::Relaxed);
    }
    None
}

/// Records the worker it ran on.
fn record_worker<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    if let Some(ran_on) = task.data::<Arc<Mutex<Vec<usize>>>>() {
        ran_on.lock().push(ctx.worker_index());
    }
    None
}

#[microsched::test]
fn test_tree_single_thread(scheduler: &Scheduler) -> Result<()> {
    let counters = run_tree(scheduler, 3, 3)?;

    assert_eq!(counters.tasks(), 40);
    assert_eq!(counters.continuations(), 13);
    assert_eq!(counters.premature(), 0);
    assert_eq!(counters.active_workers(), 1);

    assert_eq!(scheduler.live_tasks(), 0);
    Ok(())
}

#[microsched::test(worker_threads = "hardware")]
fn test_tree_hardware_threads(scheduler: &Scheduler) -> Result<()> {
    for _ in 0..100 {
        let counters = run_tree(scheduler, 3, 3)?;

        assert_eq!(counters.tasks(), expected_tasks(3, 3));
        assert_eq!(counters.continuations(), expected_continuations(3, 3));
        assert_eq!(counters.premature(), 0);
    }

    // Orphaned tree nodes may still be returning after the wait.
    wait_for("slots to be recycled", || scheduler.live_tasks() == 0)?;
    Ok(())
}

#[rstest]
#[case::root_only(1, 4, 3)]
#[case::two(2, 4, 3)]
#[case::four(4, 5, 2)]
#[case::wide(4, 2, 16)]
fn test_tree_across_pool_sizes(
    #[case] threads: usize,
    #[case] depth: u32,
    #[case] breadth: u32,
) -> Result<()> {
    let pool = Builder::new().worker_threads(threads).try_build()?;
    let scheduler = Scheduler::try_new(&pool)?;

    for _ in 0..10 {
        let counters = run_tree(&scheduler, depth, breadth)?;

        assert_eq!(counters.tasks(), expected_tasks(breadth, depth));
        assert_eq!(counters.continuations(), expected_continuations(breadth, depth));
        assert_eq!(counters.premature(), 0);
    }

    scheduler.shutdown();
    pool.shutdown()?;
    Ok(())
}

#[microsched::test(worker_threads = "hardware")]
fn test_deep_narrow_trees_stress(scheduler: &Scheduler) -> Result<()> {
    let (depth, breadth) = (11, 2);
    let start = Instant::now();

    for iteration in 0..200 {
        let counters = run_tree(scheduler, depth, breadth)?;

        assert_eq!(
            counters.tasks(),
            expected_tasks(breadth, depth),
            "lost or duplicated tasks in iteration {}",
            iteration
        );
        assert_eq!(counters.continuations(), expected_continuations(breadth, depth));
        assert_eq!(counters.premature(), 0);
    }

    assert!(start.elapsed() < DEADLINE * 4, "stress run took {:?}", start.elapsed());
    wait_for("slots to be recycled", || scheduler.live_tasks() == 0)?;
    Ok(())
}

/// Joins its own children instead of installing a continuation.
fn fan_out<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let hits = task.data::<Arc<AtomicUsize>>().cloned().expect("hits payload");

    task.reserve(8);
    for _ in 0..8 {
        let mut child = ctx
            .allocate_task(count_hit)
            .expect("allocate child")
            .with_data(hits.clone());

        task.add_child(&mut child);
        ctx.spawn_task(child);
    }

    None
}

#[rstest]
#[case::root_only(1)]
#[case::three(3)]
fn test_self_join_waits_for_children(#[case] threads: usize) -> Result<()> {
    let pool = Builder::new().worker_threads(threads).try_build()?;
    let scheduler = Scheduler::try_new(&pool)?;

    for _ in 0..50 {
        let hits = Arc::new(AtomicUsize::new(0));
        let root = scheduler.allocate_task(fan_out)?.with_data(hits.clone());

        scheduler.spawn_task_and_wait(root)?;
        assert_eq!(hits.load(Ordering::Relaxed), 8);
    }

    assert_eq!(scheduler.live_tasks(), 0);
    scheduler.shutdown();
    pool.shutdown()?;
    Ok(())
}

#[derive(Debug)]
struct Chain {
    remaining: usize,
    ran_on: Arc<Mutex<Vec<usize>>>,
}

/// Hands the next link to the worker as a bypass, and joins it so the root
/// completes last.
fn chain_link<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let chain = task.take_data::<Chain>().expect("chain payload");
    chain.ran_on.lock().push(ctx.worker_index());

    if chain.remaining == 0 {
        return None;
    }

    let mut next = ctx
        .allocate_task(chain_link)
        .expect("allocate link")
        .with_data(Chain {
            remaining: chain.remaining - 1,
            ran_on: chain.ran_on.clone(),
        });

    task.reserve(1);
    task.add_child(&mut next);
    Some(next)
}

#[microsched::test(worker_threads = 4)]
fn test_bypass_chain_stays_on_worker(scheduler: &Scheduler) -> Result<()> {
    let ran_on = Arc::new(Mutex::new(Vec::new()));

    let root = scheduler.allocate_task(chain_link)?.with_data(Chain {
        remaining: 99,
        ran_on: ran_on.clone(),
    });
    scheduler.spawn_task_and_wait(root)?;

    let ran_on = ran_on.lock();
    assert_eq!(ran_on.len(), 100);

    // Bypassed tasks never go through a queue, so nobody can steal them.
    assert!(ran_on.iter().all(|w| *w == ran_on[0]), "{:?}", ran_on);

    assert_eq!(scheduler.live_tasks(), 0);
    Ok(())
}

#[test]
fn test_affinity_routes_to_mailbox() -> Result<()> {
    let pool = Builder::new().worker_threads(3).try_build()?;
    let scheduler = Scheduler::try_new(&pool)?;

    // No pool threads from here on, queues only move when we drive them.
    pool.shutdown()?;

    let ran_on = Arc::new(Mutex::new(Vec::<usize>::new()));

    for target in [2, 1] {
        let mut task = scheduler
            .allocate_task(record_worker)?
            .with_data(ran_on.clone());
        task.set_affinity(target);
        assert_eq!(task.affinity(), Some(target));

        scheduler.spawn_task(task);
        assert_eq!(scheduler.shared.workers[target].mailbox.len(), 1);
    }
    assert!(scheduler.shared.injector.is_empty());

    // The target picks its own mail first.
    assert!(scheduler.run_once(2));
    assert_eq!(ran_on.lock().as_slice(), &[2]);

    // A starved worker takes mail addressed to a peer.
    assert!(scheduler.run_once(0));
    assert_eq!(ran_on.lock().as_slice(), &[2, 0]);

    assert!(!scheduler.run_once(0));
    assert!(!scheduler.has_work(0));
    assert_eq!(scheduler.live_tasks(), 0);

    scheduler.shutdown();
    Ok(())
}

#[test]
#[should_panic(expected = "affinity 3 out of range for 3 workers")]
fn test_affinity_out_of_range() {
    let pool = Builder::new().worker_threads(3).try_build().unwrap();
    let scheduler = Scheduler::try_new(&pool).unwrap();

    let mut task = scheduler.allocate_task(noop).unwrap();
    task.set_affinity(3);
}

#[derive(Debug)]
struct Nested {
    depth: u32,
    observed: Arc<AtomicUsize>,
}

/// Waits on a whole tree from inside a task.
fn nested_wait<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let nested = task.take_data::<Nested>().expect("nested payload");
    let counters = TreeCounters::new(ctx.scheduler().worker_count());

    let inner = ctx
        .allocate_task(continuation_passing)
        .expect("allocate inner root")
        .with_data(TreeNode {
            depth: 0,
            max_depth: nested.depth,
            breadth: 2,
            counters: counters.clone(),
            parent_done: None,
        });

    ctx.spawn_task_and_wait(inner).expect("nested wait");

    // The inner graph is complete once the nested wait returns.
    nested
        .observed
        .store(counters.tasks(), Ordering::Relaxed);
    None
}

#[rstest]
#[case::root_only(1)]
#[case::four(4)]
fn test_nested_wait(#[case] threads: usize) -> Result<()> {
    let pool = Builder::new().worker_threads(threads).try_build()?;
    let scheduler = Scheduler::try_new(&pool)?;

    for _ in 0..20 {
        let observed = Arc::new(AtomicUsize::new(0));
        let root = scheduler.allocate_task(nested_wait)?.with_data(Nested {
            depth: 5,
            observed: observed.clone(),
        });

        scheduler.spawn_task_and_wait(root)?;
        assert_eq!(observed.load(Ordering::Relaxed), expected_tasks(2, 5));
    }

    scheduler.shutdown();
    pool.shutdown()?;
    Ok(())
}

#[microsched::test(worker_threads = 3)]
fn test_external_spawns_run_on_pool_threads(scheduler: &Scheduler) -> Result<()> {
    let n = 1_000;
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..n {
        let task = scheduler.allocate_task(count_hit)?.with_data(hits.clone());
        scheduler.spawn_task(task);
    }

    wait_for("external tasks", || hits.load(Ordering::Relaxed) == n)?;
    wait_for("slots to be recycled", || scheduler.live_tasks() == 0)?;
    Ok(())
}

#[microsched::test]
fn test_payload_through_handle(scheduler: &Scheduler) -> Result<()> {
    let mut task = scheduler.allocate_task(noop)?;
    assert_eq!(task.state(), TaskState::Allocated);
    assert!(task.data::<u64>().is_none());

    task.set_data(41u64);
    if let Some(v) = task.data_mut::<u64>() {
        *v += 1;
    }
    assert_eq!(task.data::<u64>(), Some(&42));

    // Too big to live inline.
    task.set_data([7u64; 32]);
    assert!(task.data::<u64>().is_none());
    assert_eq!(task.data::<[u64; 32]>().map(|a| a[31]), Some(7));

    scheduler.spawn_task_and_wait(task)?;
    assert_eq!(scheduler.live_tasks(), 0);
    Ok(())
}

#[microsched::test]
fn test_dropped_handle_recycles_slot(scheduler: &Scheduler) -> Result<()> {
    let first = scheduler.allocate_task(noop)?;
    let id = first.id();
    assert_eq!(scheduler.live_tasks(), 1);

    drop(first);
    assert_eq!(scheduler.live_tasks(), 0);

    // Same slot, new generation.
    let second = scheduler.allocate_task(noop)?;
    assert_ne!(second.id(), id);
    assert_eq!(second.id().as_u64() as u32, id.as_u64() as u32);
    Ok(())
}

#[test]
fn test_allocation_error_surfaced() -> Result<()> {
    let pool = Builder::new().worker_threads(1).try_build()?;
    let cfg = SchedulerConfig {
        segment_size: 2,
        max_segments: 2,
        ..Default::default()
    };
    let scheduler = Scheduler::try_with_config(&pool, cfg)?;
    assert_eq!(scheduler.arena_capacity(), 4);

    let mut handles = (0..4)
        .map(|_| scheduler.allocate_task(noop))
        .collect::<Result<Vec<_>, _>>()?;

    match scheduler.allocate_task(noop) {
        Err(err @ SchedulerError::Allocation { capacity: 4 }) => assert!(err.is_retryable()),
        other => return Err(anyhow!("expected Allocation error, got {:?}", other)),
    }

    // Completing a task frees its slot.
    let task = handles.pop().ok_or_else(|| anyhow!("no handle"))?;
    scheduler.spawn_task_and_wait(task)?;
    assert_eq!(scheduler.live_tasks(), 3);

    handles.push(scheduler.allocate_task(noop)?);
    drop(handles);
    assert_eq!(scheduler.live_tasks(), 0);

    scheduler.shutdown();
    pool.shutdown()?;
    Ok(())
}

#[test]
fn test_initialize_errors() -> Result<()> {
    let pool = crate::WorkerPool::new();
    assert!(matches!(
        Scheduler::try_new(&pool),
        Err(SchedulerError::NotInitialized)
    ));

    pool.initialize(2)?;
    let cfg = SchedulerConfig {
        segment_size: 3,
        ..Default::default()
    };
    assert!(matches!(
        Scheduler::try_with_config(&pool, cfg),
        Err(SchedulerError::InvalidConfig(_))
    ));

    pool.shutdown()?;
    assert!(matches!(
        Scheduler::try_new(&pool),
        Err(SchedulerError::NotInitialized)
    ));
    Ok(())
}

#[test]
fn test_shutdown_is_idempotent() -> Result<()> {
    let pool = Builder::new().worker_threads(2).try_build()?;
    let scheduler = Scheduler::try_new(&pool)?;
    let counters = run_tree(&scheduler, 2, 2)?;
    assert_eq!(counters.tasks(), 7);

    scheduler.shutdown();
    scheduler.shutdown();
    assert!(!scheduler.is_running());
    assert!(matches!(
        scheduler.allocate_task(noop),
        Err(SchedulerError::ShutDown)
    ));

    pool.shutdown()?;
    pool.shutdown()?;
    Ok(())
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "spawn_task_and_wait on a scheduler that was shut down")]
fn test_wait_after_shutdown_asserts() {
    let pool = Builder::new().worker_threads(1).try_build().unwrap();
    let scheduler = Scheduler::try_new(&pool).unwrap();

    let task = scheduler.allocate_task(noop).unwrap();
    scheduler.shutdown();

    let _ = scheduler.spawn_task_and_wait(task);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_wait_after_shutdown_errors() -> Result<()> {
    let pool = Builder::new().worker_threads(1).try_build()?;
    let scheduler = Scheduler::try_new(&pool)?;

    let task = scheduler.allocate_task(noop)?;
    scheduler.shutdown();

    assert!(matches!(
        scheduler.spawn_task_and_wait(task),
        Err(SchedulerError::ShutDown)
    ));
    assert_eq!(scheduler.live_tasks(), 0);

    pool.shutdown()?;
    Ok(())
}

#[derive(Debug, Default)]
struct OrphanProbe {
    continuation_ran: AtomicUsize,
    continuation_before_return: AtomicUsize,
    orphan_returned: AtomicUsize,
}

fn orphan<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let probe = task.data::<Arc<OrphanProbe>>().cloned().expect("probe payload");

    let join = ctx
        .allocate_task(orphan_continuation)
        .expect("allocate continuation")
        .with_data(probe.clone());

    let mut continuation = task.set_continuation(join);
    continuation.reserve(1);

    let mut child = ctx.allocate_task(noop).expect("allocate child");
    continuation.add_child(&mut child);
    ctx.spawn_task(child);

    // Orphaned from here on: another worker runs the child and the
    // continuation while this callable is still executing.
    let start = Instant::now();
    while probe.continuation_ran.load(Ordering::Acquire) == 0 && start.elapsed() < DEADLINE {
        thread::yield_now();
    }

    if probe.continuation_ran.load(Ordering::Acquire) == 1 {
        probe.continuation_before_return.store(1, Ordering::Relaxed);
    }
    probe.orphan_returned.store(1, Ordering::Release);
    None
}

fn orphan_continuation<'s>(task: &mut Task<'s>, _: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    if let Some(probe) = task.data::<Arc<OrphanProbe>>() {
        probe.continuation_ran.fetch_add(1, Ordering::Release);
    }
    None
}

#[microsched::test(worker_threads = 3)]
fn test_orphaned_work_races_with_continuation(scheduler: &Scheduler) -> Result<()> {
    let probe = Arc::new(OrphanProbe::default());

    // Spawned from outside, so only the two pool threads run it.
    let root = scheduler.allocate_task(orphan)?.with_data(probe.clone());
    scheduler.spawn_task(root);

    wait_for("orphan to return", || {
        probe.orphan_returned.load(Ordering::Acquire) == 1
    })?;

    assert_eq!(probe.continuation_ran.load(Ordering::Relaxed), 1);
    assert_eq!(probe.continuation_before_return.load(Ordering::Relaxed), 1);

    wait_for("slots to be recycled", || scheduler.live_tasks() == 0)?;
    Ok(())
}

#[test]
fn test_schedulers_share_a_pool() -> Result<()> {
    let pool = Builder::new().worker_threads(4).try_build()?;
    let first = Scheduler::try_new(&pool)?;
    let second = Scheduler::try_new(&pool)?;

    thread::scope(|s| -> Result<()> {
        let handles = [&first, &second].map(|scheduler| {
            s.spawn(move || -> Result<()> {
                for _ in 0..20 {
                    let counters = run_tree(scheduler, 4, 3)?;
                    assert_eq!(counters.tasks(), expected_tasks(3, 4));
                    assert_eq!(counters.premature(), 0);
                }
                Ok(())
            })
        });

        for handle in handles {
            handle.join().map_err(|_| anyhow!("waiter panicked"))??;
        }
        Ok(())
    })?;

    first.shutdown();

    // The second one keeps working on its own.
    let counters = run_tree(&second, 3, 3)?;
    assert_eq!(counters.tasks(), 40);

    second.shutdown();
    pool.shutdown()?;
    Ok(())
}

#[test]
fn test_pool_shutdown_with_bound_scheduler() -> Result<()> {
    let pool = Builder::new().worker_threads(2).try_build()?;
    let scheduler = Scheduler::try_new(&pool)?;
    run_tree(&scheduler, 3, 2)?;

    // Releases the scheduler held by the pool threads.
    pool.shutdown()?;
    pool.shutdown()?;
    assert_eq!(Arc::strong_count(&scheduler.shared), 1);

    scheduler.shutdown();
    Ok(())
}

fn overcommit<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let mut first = ctx.allocate_task(noop).expect("allocate child");
    let mut second = ctx.allocate_task(noop).expect("allocate child");

    task.reserve(1);
    task.add_child(&mut first);
    task.add_child(&mut second);
    None
}

#[microsched::test]
#[cfg(debug_assertions)]
#[should_panic(expected = "registered more children than it reserved")]
fn test_registering_beyond_reservation_asserts(scheduler: &Scheduler) {
    let root = scheduler.allocate_task(overcommit).unwrap();
    let _ = scheduler.spawn_task_and_wait(root);
}

fn dropped_child<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let join = ctx.allocate_task(noop).expect("allocate continuation");
    let mut continuation = task.set_continuation(join);
    continuation.reserve(1);

    let mut child = ctx.allocate_task(noop).expect("allocate child");
    continuation.add_child(&mut child);

    // Never spawned, so the continuation would never be admitted.
    drop(child);
    None
}

#[microsched::test]
#[cfg(debug_assertions)]
#[should_panic(expected = "registered as a child was dropped without being spawned")]
fn test_dropping_registered_child_asserts(scheduler: &Scheduler) {
    let root = scheduler.allocate_task(dropped_child).unwrap();
    let _ = scheduler.spawn_task_and_wait(root);
}

fn self_join_after_continuation<'s>(
    task: &mut Task<'s>,
    ctx: &TaskContext<'s>,
) -> Option<TaskHandle<'s>> {
    let join = ctx.allocate_task(noop).expect("allocate continuation");
    task.set_continuation(join);

    // The waiter now hangs off the continuation, which would not wait for this.
    task.reserve(1);
    None
}

#[microsched::test]
#[cfg(debug_assertions)]
#[should_panic(expected = "reserved children on itself after installing a continuation")]
fn test_self_join_after_continuation_asserts(scheduler: &Scheduler) {
    let root = scheduler
        .allocate_task(self_join_after_continuation)
        .unwrap();
    let _ = scheduler.spawn_task_and_wait(root);
}

fn late_continuation<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let mut child = ctx.allocate_task(noop).expect("allocate child");
    task.reserve(1);
    task.add_child(&mut child);
    ctx.spawn_task(child);

    let join = ctx.allocate_task(noop).expect("allocate continuation");
    task.set_continuation(join);
    None
}

#[microsched::test]
#[cfg(debug_assertions)]
#[should_panic(expected = "after children were reserved on it")]
fn test_continuation_after_children_asserts(scheduler: &Scheduler) {
    let root = scheduler.allocate_task(late_continuation).unwrap();
    let _ = scheduler.spawn_task_and_wait(root);
}

fn two_continuations<'s>(task: &mut Task<'s>, ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let first = ctx.allocate_task(noop).expect("allocate continuation");
    let second = ctx.allocate_task(noop).expect("allocate continuation");

    task.set_continuation(first);
    task.set_continuation(second);
    None
}

#[microsched::test]
#[cfg(debug_assertions)]
#[should_panic(expected = "already has a continuation")]
fn test_second_continuation_asserts(scheduler: &Scheduler) {
    let root = scheduler.allocate_task(two_continuations).unwrap();
    let _ = scheduler.spawn_task_and_wait(root);
}
