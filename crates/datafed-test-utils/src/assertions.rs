//! Custom assertion helpers for integration tests.

use datafed_core::{RepoId, SubjectId, TaskId};
use datafed_tasks::store::Transaction;
use datafed_tasks::task::TaskStatus;

use crate::fixtures::World;

/// Asserts that a task is in `expected` state.
///
/// # Panics
///
/// Panics if the task is missing or in another state.
pub fn assert_task_status(world: &World, task_id: &TaskId, expected: TaskStatus) {
    let task = world.read(|tx| tx.require_task(task_id)).unwrap();
    assert_eq!(
        task.status, expected,
        "Expected task {task_id} to be {expected}, but it was {} ({})",
        task.status, task.message
    );
}

/// Asserts that a finished task left no lock or block edges behind.
///
/// # Panics
///
/// Panics if any edge references the task.
pub fn assert_no_edges(world: &World, task_id: &TaskId) {
    world.read(|tx| {
        assert!(
            tx.locks_held_by(task_id).unwrap().is_empty(),
            "Task {task_id} still holds locks"
        );
        assert!(
            tx.blockers_of(task_id).unwrap().is_empty(),
            "Task {task_id} is still blocked"
        );
        assert!(
            tx.waiting_on(task_id).unwrap().is_empty(),
            "Tasks still wait on {task_id}"
        );
    });
}

/// Asserts an allocation's record count and byte usage.
///
/// # Panics
///
/// Panics if the allocation is missing or its counters differ.
pub fn assert_allocation(world: &World, subject: &SubjectId, repo: &RepoId, rec_count: u64, data_size: u64) {
    let alloc = world
        .read(|tx| tx.allocation(subject, repo))
        .unwrap()
        .unwrap_or_else(|| panic!("Expected allocation for {subject} on {repo}"));
    assert_eq!(
        (alloc.rec_count, alloc.data_size),
        (rec_count, data_size),
        "Allocation counters of {subject} on {repo}"
    );
}

/// Asserts the admission invariant: among tasks that are not blocked and
/// not finished, no two hold conflicting locks on the same resource within
/// the same context.
///
/// # Panics
///
/// Panics on the first pair of conflicting active locks.
pub fn assert_no_conflicting_active_locks(tx: &dyn Transaction) {
    let active: Vec<TaskId> = tx
        .tasks()
        .unwrap()
        .into_iter()
        .filter(|t| t.status.is_runnable())
        .map(|t| t.id)
        .collect();

    for task in &active {
        for lock in tx.locks_held_by(task).unwrap() {
            for other in tx.locks_on(&lock.resource).unwrap() {
                if other.task == *task || other.context != lock.context {
                    continue;
                }
                if !active.contains(&other.task) {
                    continue;
                }
                assert!(
                    !(lock.is_exclusive() || other.is_exclusive()),
                    "Active tasks {task} and {} conflict on {}",
                    other.task,
                    lock.resource
                );
            }
        }
    }
}
