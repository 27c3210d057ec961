//! Admission control: lock and block edges between tasks and resources.
//!
//! A task registers one lock per resource it depends on. A lock request
//! conflicts with every earlier lock on the same resource and context when
//! either side is exclusive; each conflict becomes a block edge from the new
//! task to the earlier holder. Admission is first-registered-first-served: a
//! later task never preempts an earlier one.
//!
//! ## Invariants
//!
//! - A task is READY or RUNNING iff it has no outgoing block edges
//! - [`complete`] removes exactly the block edges pointing at the finished
//!   task, promotes every waiter left without blockers, and drops the finished
//!   task's own edges in the same transaction as its status update

use serde::{Deserialize, Serialize};

use datafed_core::{ResourceId, SubjectId, TaskId};

use crate::error::{Error, Result};
use crate::store::Transaction;
use crate::task::{Task, TaskStatus, TaskType};

/// Message of a task waiting on block edges.
pub const MSG_QUEUED: &str = "Queued";
/// Message of a task admitted but not yet running.
pub const MSG_PENDING: &str = "Pending";
/// Message of a task that finished successfully.
pub const MSG_FINISHED: &str = "Finished";
/// Message of a task that failed without a reason.
pub const MSG_FAILED_UNKNOWN: &str = "Failed (unknown reason)";

/// A task's hold on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEdge {
    /// Holding task.
    pub task: TaskId,
    /// Locked resource.
    pub resource: ResourceId,
    /// `0` for shared access, anything greater for exclusive access.
    pub level: u32,
    /// Optional scope; locks only conflict within the same context.
    pub context: Option<ResourceId>,
}

impl LockEdge {
    /// Returns true for exclusive locks.
    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.level > 0
    }
}

/// `blocked` cannot run until `blocker` completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEdge {
    /// The waiting task.
    pub blocked: TaskId,
    /// The task holding a conflicting lock.
    pub blocker: TaskId,
}

/// A resource a new task must lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Resource to lock.
    pub resource: ResourceId,
    /// Lock level.
    pub level: u32,
    /// Optional conflict scope.
    pub context: Option<ResourceId>,
}

impl Dependency {
    /// Shared (read) access.
    #[must_use]
    pub fn shared(resource: impl Into<ResourceId>) -> Self {
        Self {
            resource: resource.into(),
            level: 0,
            context: None,
        }
    }

    /// Exclusive (write) access.
    #[must_use]
    pub fn exclusive(resource: impl Into<ResourceId>) -> Self {
        Self {
            resource: resource.into(),
            level: 1,
            context: None,
        }
    }

    /// Scopes the dependency to a context such as a subject.
    #[must_use]
    pub fn in_context(mut self, context: impl Into<ResourceId>) -> Self {
        self.context = Some(context.into());
        self
    }

    const fn conflicts_with(&self, lock: &LockEdge) -> bool {
        self.level > 0 || lock.is_exclusive()
    }
}

/// Registers `deps` as locks of `task` and adds block edges for every
/// conflicting earlier lock.
///
/// Returns true when the task was blocked.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn register_locks(tx: &mut dyn Transaction, task: &TaskId, deps: &[Dependency]) -> Result<bool> {
    let mut blockers: Vec<TaskId> = Vec::new();

    for dep in deps {
        for lock in tx.locks_on(&dep.resource)? {
            if lock.task == *task || lock.context != dep.context || !dep.conflicts_with(&lock) {
                continue;
            }
            if !blockers.contains(&lock.task) {
                blockers.push(lock.task);
            }
        }

        tx.put_lock(LockEdge {
            task: *task,
            resource: dep.resource.clone(),
            level: dep.level,
            context: dep.context.clone(),
        })?;
    }

    for blocker in &blockers {
        tx.put_block(BlockEdge {
            blocked: *task,
            blocker: *blocker,
        })?;
    }

    Ok(!blockers.is_empty())
}

/// Persists a freshly created task and admits it against `deps`.
///
/// The task is stored READY ("Pending"), or BLOCKED ("Queued") when any
/// dependency conflicts with an earlier lock. Returns true when blocked.
///
/// # Errors
///
/// Returns an error if the store fails.
#[tracing::instrument(skip(tx, task, deps), fields(task_id = %task.id, task_type = %task.task_type))]
pub fn admit(tx: &mut dyn Transaction, task: &mut Task, deps: &[Dependency]) -> Result<bool> {
    let blocked = register_locks(tx, &task.id, deps)?;
    if blocked {
        task.status = TaskStatus::Blocked;
        task.message = MSG_QUEUED.to_string();
        tracing::debug!("task queued behind earlier locks");
    }
    tx.put_task(task.clone())?;
    Ok(blocked)
}

/// Finishes a task and propagates the completion through the block graph.
///
/// Returns the ids of tasks promoted to READY, in block-edge order.
///
/// # Errors
///
/// Returns `InvalidParam` when the task is already terminal and `NotFound`
/// when it does not exist.
#[tracing::instrument(skip_all, fields(task_id = %task_id, success = success))]
pub fn complete(
    tx: &mut dyn Transaction,
    task_id: &TaskId,
    success: bool,
    message: Option<&str>,
) -> Result<Vec<TaskId>> {
    let mut task = tx.require_task(task_id)?;
    if task.status.is_terminal() {
        return Err(Error::InvalidParam(format!(
            "task {task_id} already finished as {}",
            task.status
        )));
    }

    let mut ready = Vec::new();
    for waiter in tx.waiting_on(task_id)? {
        let edge = BlockEdge {
            blocked: waiter,
            blocker: *task_id,
        };
        tx.remove_block(&edge)?;
        if tx.blockers_of(&waiter)?.is_empty() {
            let mut dependent = tx.require_task(&waiter)?;
            if dependent.status == TaskStatus::Blocked {
                dependent.transition_to(TaskStatus::Ready, MSG_PENDING)?;
                tx.put_task(dependent)?;
                ready.push(waiter);
            }
        }
    }

    for blocker in tx.blockers_of(task_id)? {
        tx.remove_block(&BlockEdge {
            blocked: *task_id,
            blocker,
        })?;
    }
    tx.remove_locks_held_by(task_id)?;

    if success {
        task.transition_to(TaskStatus::Succeeded, MSG_FINISHED)?;
    } else {
        let message = message.unwrap_or(MSG_FAILED_UNKNOWN).to_string();
        task.error = Some(message.clone());
        task.transition_to(TaskStatus::Failed, message)?;
    }
    tx.put_task(task)?;

    tracing::info!(promoted = ready.len(), "task completed");
    Ok(ready)
}

/// Fails with `InUse` when any task holds a lock on one of `resources`.
///
/// # Errors
///
/// Returns `InUse` naming the first locked resource.
pub fn ensure_exclusive_access<'a, I>(tx: &dyn Transaction, resources: I) -> Result<()>
where
    I: IntoIterator<Item = &'a ResourceId>,
{
    for resource in resources {
        if !tx.locks_on(resource)?.is_empty() {
            return Err(Error::InUse(format!(
                "operation not permitted, '{resource}' in use"
            )));
        }
    }
    Ok(())
}

/// Fails with `InUse` when an unfinished task of `task_type` already locks
/// `resource` within `context`.
///
/// # Errors
///
/// Returns `InUse` on a duplicate.
pub fn ensure_no_duplicate(
    tx: &dyn Transaction,
    task_type: TaskType,
    resource: &ResourceId,
    context: &SubjectId,
) -> Result<()> {
    let context = ResourceId::from(context);
    for lock in tx.locks_on(resource)? {
        if lock.context.as_ref() != Some(&context) {
            continue;
        }
        if let Some(holder) = tx.task(&lock.task)? {
            if holder.task_type == task_type && !holder.status.is_terminal() {
                return Err(Error::InUse(format!(
                    "a duplicate {task_type} task was found ({})",
                    holder.id
                )));
            }
        }
    }
    Ok(())
}

/// Ids of tasks `task` is waiting on, and of tasks waiting on `task`.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn edges_of(tx: &dyn Transaction, task: &TaskId) -> Result<(Vec<TaskId>, Vec<TaskId>)> {
    Ok((tx.blockers_of(task)?, tx.waiting_on(task)?))
}
