//! Per-type task state machines.
//!
//! Every task type implements [`StepRunner`]. The task service owns the
//! shared frame: it persists the signed step counter, checks confirmed
//! steps, and drives rollback. A runner only says what one step does.
//!
//! ## Step layout
//!
//! - Step `0` plans the task and returns the final step count
//! - Steps `1..steps-1` either emit a worker command (the service waits for
//!   the driver to confirm the step) or apply local effects and advance
//! - Step `steps-1` finalizes the task through [`StepRunner::finalize`]
//!
//! Rollback runs [`StepRunner::rollback`] for every step from the failed one
//! down to `1`. Steps whose local effects cannot be undone are points of no
//! return and roll back as no-ops.

pub mod alloc_create;
pub mod alloc_delete;
mod chunked;
pub mod data_get;
pub mod data_put;
pub mod proj_delete;
pub mod rec_alloc_change;
pub mod rec_coll_delete;
pub mod rec_owner_change;

use std::collections::HashMap;

use chrono::Utc;

use datafed_core::TaskId;

use crate::admission;
use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::metrics::TaskMetrics;
use crate::store::Transaction;
use crate::task::{Command, Credentials, Encryption, Task, TaskType, TransferParams};
use crate::transfer::TransferDescriptor;

/// Everything a step may read or mutate.
pub struct StepContext<'a> {
    /// The transaction the step runs in.
    pub tx: &'a mut dyn Transaction,
    /// The task, persisted by the service after the step.
    pub task: &'a mut Task,
    /// Orchestration settings.
    pub config: &'a TaskConfig,
    /// Metrics recorder.
    pub metrics: &'a TaskMetrics,
}

/// What a forward step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Hand a command to the worker and wait for confirmation.
    Command(Command),
    /// Local effects applied; continue with the next step.
    Advance,
}

/// One task type's state machine.
pub trait StepRunner: Send + Sync {
    /// The task type this runner drives.
    fn task_type(&self) -> TaskType;

    /// Plans the task at step `0` and returns the total step count.
    ///
    /// # Errors
    ///
    /// Any error fails the task without rollback.
    fn plan(&self, ctx: &mut StepContext<'_>) -> Result<i64>;

    /// Executes forward step `step` (`1..steps-1`).
    ///
    /// # Errors
    ///
    /// A non-transient error starts rollback from `step`.
    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome>;

    /// Undoes the local effects of `step`.
    ///
    /// # Errors
    ///
    /// An error aborts the rollback and fails the task with a combined message.
    fn rollback(&self, _ctx: &mut StepContext<'_>, _step: i64) -> Result<()> {
        Ok(())
    }

    /// Completes the task successfully and returns newly runnable tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn finalize(&self, ctx: &mut StepContext<'_>) -> Result<Vec<TaskId>> {
        admission::complete(ctx.tx, &ctx.task.id, true, None)
    }
}

/// Lookup table from task type to its runner.
pub struct MachineRegistry {
    runners: HashMap<TaskType, Box<dyn StepRunner>>,
}

impl std::fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRegistry")
            .field("types", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MachineRegistry {
    /// A registry holding a runner for every task type.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self {
            runners: HashMap::new(),
        };
        for task_type in TaskType::ALL {
            registry.register(standard_runner(task_type));
        }
        registry
    }

    /// Registers `runner`, replacing any runner for the same type.
    pub fn register(&mut self, runner: Box<dyn StepRunner>) {
        self.runners.insert(runner.task_type(), runner);
    }

    /// Returns the runner for `task_type`.
    ///
    /// # Errors
    ///
    /// Returns `InternalFault` when no runner is registered.
    pub fn get(&self, task_type: TaskType) -> Result<&dyn StepRunner> {
        self.runners
            .get(&task_type)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::InternalFault(format!("no state machine for {task_type}")))
    }
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn standard_runner(task_type: TaskType) -> Box<dyn StepRunner> {
    match task_type {
        TaskType::AllocCreate => Box::new(alloc_create::AllocCreate),
        TaskType::AllocDelete => Box::new(alloc_delete::AllocDelete),
        TaskType::DataGet => Box::new(data_get::DataGet),
        TaskType::DataPut => Box::new(data_put::DataPut),
        TaskType::RecAllocChange => Box::new(rec_alloc_change::RecAllocChange),
        TaskType::RecOwnerChange => Box::new(rec_owner_change::RecOwnerChange),
        TaskType::RecCollDelete => Box::new(rec_coll_delete::RecCollDelete),
        TaskType::ProjDelete => Box::new(proj_delete::ProjDelete),
    }
}

pub(crate) fn payload_mismatch(task: &Task) -> Error {
    Error::InternalFault(format!(
        "task {} carries a {} payload for a {} runner",
        task.id,
        task.payload.task_type(),
        task.task_type
    ))
}

pub(crate) fn out_of_range(task: &Task, step: i64) -> Error {
    Error::InternalFault(format!(
        "task {} has no step {step} (steps = {})",
        task.id, task.steps
    ))
}

/// Looks up the planned item at `index` (0-based).
pub(crate) fn planned<T: Clone>(task: &Task, items: &[T], index: i64) -> Result<T> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| out_of_range(task, index + 1))
}

/// Builds a transfer command carrying the client's stored credentials.
pub(crate) fn transfer_command(
    tx: &dyn Transaction,
    task: &Task,
    encrypt: Encryption,
    descriptor: TransferDescriptor,
) -> Result<Command> {
    let credentials = tx
        .user(&task.client)?
        .and_then(|user| user.tokens)
        .map(|tokens| Credentials {
            access_token: tokens.access,
            refresh_token: tokens.refresh,
            expires_in: u64::try_from((tokens.expires_at - Utc::now()).num_seconds())
                .unwrap_or(0),
        });

    Ok(Command::RawDataTransfer(TransferParams {
        client: task.client.clone(),
        task_type: task.task_type,
        encrypt,
        descriptor,
        credentials,
    }))
}

/// Step count of a task that runs `commands` worker commands between its
/// plan and finalize steps.
pub(crate) fn steps_for(commands: usize, per_command: i64, extra: i64) -> Result<i64> {
    i64::try_from(commands)
        .ok()
        .and_then(|n| n.checked_mul(per_command))
        .and_then(|n| n.checked_add(extra))
        .ok_or_else(|| Error::InternalFault("step count overflow".into()))
}
