//! Persisted task documents and the commands they emit.
//!
//! This module provides:
//! - `TaskType`: The closed set of task state machines
//! - `TaskStatus`: The admission/execution status of a task
//! - `Task`: The persisted task document with its signed step counter
//! - `TaskPayload`: The type-specific state carried between steps
//! - `Command`/`Reply`: What a run hands back to the external worker

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datafed_core::{CollectionId, RecordId, RepoId, SubjectId, TaskId};

use crate::error::{Error, Result};
use crate::preprocess::ClassifiedRecord;
use crate::transfer::{AllocTarget, RepoFiles, TransferDescriptor};

/// The kind of long-running operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Download raw data to a remote endpoint.
    DataGet,
    /// Upload raw data from a remote endpoint.
    DataPut,
    /// Create a storage allocation.
    AllocCreate,
    /// Delete a storage allocation.
    AllocDelete,
    /// Move records to another repository.
    RecAllocChange,
    /// Move records to another owner.
    RecOwnerChange,
    /// Delete records and collections.
    RecCollDelete,
    /// Delete projects with everything they own.
    ProjDelete,
}

impl TaskType {
    /// Every task type, in registration order.
    pub const ALL: [Self; 8] = [
        Self::DataGet,
        Self::DataPut,
        Self::AllocCreate,
        Self::AllocDelete,
        Self::RecAllocChange,
        Self::RecOwnerChange,
        Self::RecCollDelete,
        Self::ProjDelete,
    ];

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::DataGet => "data_get",
            Self::DataPut => "data_put",
            Self::AllocCreate => "alloc_create",
            Self::AllocDelete => "alloc_delete",
            Self::RecAllocChange => "rec_alloc_change",
            Self::RecOwnerChange => "rec_owner_change",
            Self::RecCollDelete => "rec_coll_delete",
            Self::ProjDelete => "proj_delete",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Status of a task.
///
/// ```text
///  BLOCKED ──► READY ──► RUNNING ──► SUCCEEDED
///     │          │          │
///     └──────────┴──────────┴──────► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting on block edges.
    Blocked,
    /// Admitted; waiting for a driver.
    Ready,
    /// A driver is advancing the task.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error or aborted.
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true for statuses a driver may pick up.
    #[must_use]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    /// Returns true if the transition to `target` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Blocked => matches!(target, Self::Ready | Self::Failed),
            Self::Ready => matches!(target, Self::Running | Self::Failed),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed),
            Self::Succeeded | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Blocked => "BLOCKED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Encryption requested for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    /// Never encrypt.
    #[default]
    None,
    /// Encrypt when both endpoints support it.
    Available,
    /// Always encrypt; fail otherwise.
    Force,
}

/// State of an allocation create or delete task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocPayload {
    /// Repository of the allocation.
    pub repo_id: RepoId,
    /// Subject of the allocation.
    pub subject: SubjectId,
    /// Storage path of the allocation.
    pub repo_path: String,
    /// Byte limit.
    pub data_limit: u64,
    /// Record limit.
    pub rec_limit: u64,
}

/// State of a data get task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPayload {
    /// Remote destination (`endpoint/path`).
    pub path: String,
    /// Requested encryption.
    pub encrypt: Encryption,
    /// Name files after their original source file names.
    pub orig_fname: bool,
    /// Managed records to transfer.
    pub glob_data: Vec<ClassifiedRecord>,
    /// External records to transfer.
    pub ext_data: Vec<ClassifiedRecord>,
    /// Planned transfers.
    #[serde(default)]
    pub xfr: Vec<TransferDescriptor>,
}

/// State of a data put task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutPayload {
    /// Remote source file (`endpoint/path/file`).
    pub path: String,
    /// Requested encryption.
    pub encrypt: Encryption,
    /// Explicit extension for the record.
    pub ext: Option<String>,
    /// The record receiving the upload.
    pub glob_data: Vec<ClassifiedRecord>,
    /// Planned transfers.
    #[serde(default)]
    pub xfr: Vec<TransferDescriptor>,
    /// Size updates, one per repository directory holding a record.
    #[serde(default)]
    pub sizes: Vec<RepoFiles>,
}

/// State of an allocation change or ownership change task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    /// Owner of the destination allocation.
    pub owner: SubjectId,
    /// Destination repository.
    pub dst_repo: RepoId,
    /// Destination collection (ownership change only).
    pub dst_coll: Option<CollectionId>,
    /// Managed records to move.
    pub glob_data: Vec<ClassifiedRecord>,
    /// External records changing owner (ownership change only).
    #[serde(default)]
    pub ext_data: Vec<ClassifiedRecord>,
    /// Planned transfer chunks.
    #[serde(default)]
    pub xfr: Vec<TransferDescriptor>,
}

/// State of a record/collection delete task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePayload {
    /// Collections to delete.
    pub collections: Vec<CollectionId>,
    /// Records to delete.
    pub records: Vec<RecordId>,
    /// Raw data to delete, grouped by repository.
    pub del_data: Vec<RepoFiles>,
}

/// State of a project delete task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjDeletePayload {
    /// Projects to delete.
    pub projects: Vec<SubjectId>,
    /// Allocations whose storage must be removed.
    pub allocs: Vec<AllocTarget>,
}

/// Type-specific state persisted with a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Allocation create.
    AllocCreate(AllocPayload),
    /// Allocation delete.
    AllocDelete(AllocPayload),
    /// Data get.
    DataGet(GetPayload),
    /// Data put.
    DataPut(PutPayload),
    /// Record allocation change.
    RecAllocChange(MovePayload),
    /// Record ownership change.
    RecOwnerChange(MovePayload),
    /// Record/collection delete.
    RecCollDelete(DeletePayload),
    /// Project delete.
    ProjDelete(ProjDeletePayload),
}

impl TaskPayload {
    /// Returns the task type this payload belongs to.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        match self {
            Self::AllocCreate(_) => TaskType::AllocCreate,
            Self::AllocDelete(_) => TaskType::AllocDelete,
            Self::DataGet(_) => TaskType::DataGet,
            Self::DataPut(_) => TaskType::DataPut,
            Self::RecAllocChange(_) => TaskType::RecAllocChange,
            Self::RecOwnerChange(_) => TaskType::RecOwnerChange,
            Self::RecCollDelete(_) => TaskType::RecCollDelete,
            Self::ProjDelete(_) => TaskType::ProjDelete,
        }
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Task type.
    pub task_type: TaskType,
    /// Current status.
    pub status: TaskStatus,
    /// Forward index when non-negative; rollback from `|step|` when negative.
    pub step: i64,
    /// Total number of steps.
    pub steps: i64,
    /// Type-specific state.
    pub payload: TaskPayload,
    /// Client that requested the task.
    pub client: SubjectId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Human-readable progress message.
    pub message: String,
    /// Error that failed the task.
    pub error: Option<String>,
}

impl Task {
    /// Creates a READY task at step 0.
    #[must_use]
    pub fn new(client: SubjectId, payload: TaskPayload, steps: i64) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            task_type: payload.task_type(),
            status: TaskStatus::Ready,
            step: 0,
            steps,
            payload,
            client,
            created_at: now,
            updated_at: now,
            message: "Pending".to_string(),
            error: None,
        }
    }

    /// Returns true while the task is unwinding.
    #[must_use]
    pub const fn is_rolling_back(&self) -> bool {
        self.step < 0
    }

    /// Transitions to a new status with a progress message.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self, message),
        fields(task_id = %self.id, from = %self.status, to = %target)
    )]
    pub fn transition_to(&mut self, target: TaskStatus, message: impl Into<String>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                task_id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.message = message.into();
        self.touch();
        Ok(())
    }

    /// Bumps `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Access credentials forwarded to the transfer service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Seconds until the access token expires, clamped at zero.
    pub expires_in: u64,
}

/// Parameters of a raw data transfer command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    /// Client on whose behalf the transfer runs.
    pub client: SubjectId,
    /// Type of the emitting task.
    pub task_type: TaskType,
    /// Requested encryption.
    pub encrypt: Encryption,
    /// What to move.
    pub descriptor: TransferDescriptor,
    /// Client credentials, when linked.
    pub credentials: Option<Credentials>,
}

/// A command for the external worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// The task finished; carries tasks that became runnable.
    Stop(Vec<TaskId>),
    /// Move raw data between endpoints.
    RawDataTransfer(TransferParams),
    /// Delete raw data files.
    RawDataDelete(RepoFiles),
    /// Recompute raw data sizes.
    RawDataUpdateSize(RepoFiles),
    /// Create allocation storage.
    AllocCreate(AllocTarget),
    /// Delete allocation storage.
    AllocDelete(AllocTarget),
}

impl Command {
    /// Returns the numeric wire code of the command.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::Stop(_) => 0,
            Self::RawDataTransfer(_) => 1,
            Self::RawDataDelete(_) => 2,
            Self::RawDataUpdateSize(_) => 3,
            Self::AllocCreate(_) => 4,
            Self::AllocDelete(_) => 5,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Stop(_) => "stop",
            Self::RawDataTransfer(_) => "raw_data_transfer",
            Self::RawDataDelete(_) => "raw_data_delete",
            Self::RawDataUpdateSize(_) => "raw_data_update_size",
            Self::AllocCreate(_) => "alloc_create",
            Self::AllocDelete(_) => "alloc_delete",
        }
    }
}

/// What a run call returns to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// The command to execute.
    pub command: Command,
    /// Step to confirm once the command succeeded; `None` for `STOP`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
}

impl Reply {
    /// A command waiting for confirmation of `step`.
    #[must_use]
    pub const fn command(command: Command, step: i64) -> Self {
        Self {
            command,
            step: Some(step),
        }
    }

    /// A terminal reply listing newly runnable tasks.
    #[must_use]
    pub const fn stop(ready: Vec<TaskId>) -> Self {
        Self {
            command: Command::Stop(ready),
            step: None,
        }
    }

    /// Returns true for a `STOP` reply.
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        matches!(self.command, Command::Stop(_))
    }
}
