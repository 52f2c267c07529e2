//! Fork-join tree fixtures.
//!
//! `continuation_passing` expands a full tree of the given depth and breadth:
//! every internal node installs a continuation, reserves one completion per
//! child and spawns its children. The continuation checks that all of its
//! children reported in before it ran.

use crate::{Scheduler, Task, TaskContext, TaskHandle};
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[derive(Debug)]
pub(crate) struct TreeCounters {
    per_worker: Box<[AtomicUsize]>,
    pub(crate) continuations: AtomicUsize,

    /// Continuations that ran before all of their children reported in.
    pub(crate) premature: AtomicUsize,
}

impl TreeCounters {
    pub(crate) fn new(workers: usize) -> Arc<Self> {
        Arc::new(Self {
            per_worker: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            continuations: AtomicUsize::new(0),
            premature: AtomicUsize::new(0),
        })
    }

    fn record_task(&self, worker_index: usize) {
        self.per_worker[worker_index].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tasks(&self) -> usize {
        self.per_worker.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub(crate) fn continuations(&self) -> usize {
        self.continuations.load(Ordering::Relaxed)
    }

    pub(crate) fn premature(&self) -> usize {
        self.premature.load(Ordering::Relaxed)
    }

    /// Workers that ran at least one tree node.
    pub(crate) fn active_workers(&self) -> usize {
        self.per_worker
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) > 0)
            .count()
    }
}

/// Payload of a tree node.
#[derive(Debug)]
pub(crate) struct TreeNode {
    pub(crate) depth: u32,
    pub(crate) max_depth: u32,
    pub(crate) breadth: u32,
    pub(crate) counters: Arc<TreeCounters>,

    /// Bumped when this node's subtree is done.
    pub(crate) parent_done: Option<Arc<AtomicU32>>,
}

/// Payload of a node's continuation.
#[derive(Debug)]
struct JoinData {
    expected: u32,
    done: Arc<AtomicU32>,
    counters: Arc<TreeCounters>,
    parent_done: Option<Arc<AtomicU32>>,
}

fn report_done(parent_done: Option<&Arc<AtomicU32>>) {
    if let Some(done) = parent_done {
        done.fetch_add(1, Ordering::Release);
    }
}

pub(crate) fn continuation_passing<'s>(
    task: &mut Task<'s>,
    ctx: &TaskContext<'s>,
) -> Option<TaskHandle<'s>> {
    let node = task.take_data::<TreeNode>().expect("tree node payload");
    node.counters.record_task(ctx.worker_index());

    if node.depth == node.max_depth {
        report_done(node.parent_done.as_ref());
        return None;
    }

    let done = Arc::new(AtomicU32::new(0));
    let join = ctx
        .allocate_task(tree_continuation)
        .expect("allocate continuation")
        .with_data(JoinData {
            expected: node.breadth,
            done: done.clone(),
            counters: node.counters.clone(),
            parent_done: node.parent_done.clone(),
        });

    let mut continuation = task.set_continuation(join);
    continuation.reserve(node.breadth);

    for _ in 0..node.breadth {
        let mut child = ctx
            .allocate_task(continuation_passing)
            .expect("allocate child")
            .with_data(TreeNode {
                depth: node.depth + 1,
                max_depth: node.max_depth,
                breadth: node.breadth,
                counters: node.counters.clone(),
                parent_done: Some(done.clone()),
            });

        continuation.add_child(&mut child);
        ctx.spawn_task(child);
    }

    None
}

fn tree_continuation<'s>(task: &mut Task<'s>, _ctx: &TaskContext<'s>) -> Option<TaskHandle<'s>> {
    let join = task.take_data::<JoinData>().expect("join payload");

    if join.done.load(Ordering::Acquire) != join.expected {
        join.counters.premature.fetch_add(1, Ordering::Relaxed);
    }

    join.counters.continuations.fetch_add(1, Ordering::Relaxed);
    report_done(join.parent_done.as_ref());
    None
}

/// Runs a full tree to completion from the calling thread.
pub(crate) fn run_tree(scheduler: &Scheduler, depth: u32, breadth: u32) -> Result<Arc<TreeCounters>> {
    let counters = TreeCounters::new(scheduler.worker_count());

    let root = scheduler
        .allocate_task(continuation_passing)?
        .with_data(TreeNode {
            depth: 0,
            max_depth: depth,
            breadth,
            counters: counters.clone(),
            parent_done: None,
        });

    scheduler.spawn_task_and_wait(root)?;
    Ok(counters)
}

/// Nodes of a full tree, root at depth 0.
pub(crate) fn expected_tasks(breadth: u32, depth: u32) -> usize {
    (0..=depth).map(|d| (breadth as usize).pow(d)).sum()
}

/// Internal nodes of a full tree, each running one continuation.
pub(crate) fn expected_continuations(breadth: u32, depth: u32) -> usize {
    match depth {
        0 => 0,
        d => expected_tasks(breadth, d - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_form() {
        assert_eq!(expected_tasks(3, 3), 40);
        assert_eq!(expected_continuations(3, 3), 13);
        assert_eq!(expected_tasks(2, 10), (1 << 11) - 1);
        assert_eq!(expected_continuations(5, 0), 0);
    }
}
