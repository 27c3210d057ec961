//! Task lifecycle operations.
//!
//! [`TaskService`] creates tasks (`init_*`), advances them (`run`), and
//! answers lifecycle queries. Every operation runs inside transactions
//! obtained through [`retry::transact`], so write conflicts are retried with
//! backoff and validation errors surface before any task or lock exists.
//!
//! ## Run protocol
//!
//! 1. The first `run` call for a READY task passes no confirmed step; the
//!    task becomes RUNNING
//! 2. Each later call confirms the step of the last command. A confirmed step
//!    that does not equal the task's step is rejected without side effects
//! 3. Steps that apply local effects advance immediately. Each runs in its
//!    own transaction
//! 4. An external error, or a failing step after step `0`, negates the step
//!    and rolls the task back before failing it
//! 5. The final step completes the task and returns `STOP` with the tasks the
//!    completion unblocked

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datafed_core::{perm, CollectionId, RepoId, ResourceId, SubjectId, TaskId};

use crate::admission::{self, Dependency, MSG_FAILED_UNKNOWN};
use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::machines::{MachineRegistry, StepContext, StepOutcome};
use crate::metrics::{time_step, TaskMetrics};
use crate::model::{Allocation, ItemRef, User};
use crate::permissions::{AclOracle, PermissionOracle};
use crate::preprocess::{self, Classification, ClassifiedRecord, Mode};
use crate::retry::{self, RetryPolicy};
use crate::store::{ResourceStore, Transaction};
use crate::task::{
    AllocPayload, DeletePayload, Encryption, GetPayload, MovePayload, ProjDeletePayload,
    PutPayload, Reply, Task, TaskPayload, TaskStatus,
};
use crate::transfer;

const MSG_RUNNING: &str = "Running";

/// Classification plus the task created for it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classified {
    /// What the request resolved to.
    pub classification: Classification,
    /// The created task; `None` for checks or when nothing needs doing.
    pub task: Option<Task>,
}

/// Result of [`TaskService::init_rec_alloc_change`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocChangeInit {
    /// Records in the request.
    pub tot_cnt: usize,
    /// Records that actually move.
    pub act_cnt: usize,
    /// Bytes that actually move.
    pub act_size: u64,
    /// Destination byte limit.
    pub data_limit: u64,
    /// Destination bytes in use.
    pub data_size: u64,
    /// Destination record limit.
    pub rec_limit: u64,
    /// Destination records in use.
    pub rec_count: u64,
    /// The created task, if any.
    pub task: Option<Task>,
}

/// Result of [`TaskService::init_rec_owner_change`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerChangeInit {
    /// Records in the request.
    pub tot_cnt: usize,
    /// Records that actually change owner.
    pub act_cnt: usize,
    /// Managed bytes that move.
    pub act_size: u64,
    /// The new owner's allocations, sorted by repository (check mode only).
    pub allocs: Vec<Allocation>,
    /// The created task, if any.
    pub task: Option<Task>,
}

/// A task with its admission edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    /// The task.
    pub task: Task,
    /// Tasks this task waits on.
    pub blocked_by: Vec<TaskId>,
    /// Tasks waiting on this task.
    pub blocking: Vec<TaskId>,
}

/// Filters for [`TaskService::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only tasks in one of these states; empty means any.
    pub status: Vec<TaskStatus>,
    /// Only tasks updated within this window. Overrides `from`/`to`.
    pub since: Option<Duration>,
    /// Only tasks updated at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only tasks updated at or before this time.
    pub to: Option<DateTime<Utc>>,
    /// Tasks to skip.
    pub offset: usize,
    /// Maximum tasks to return.
    pub count: Option<usize>,
}

/// How a run call continues after validating the request.
enum Entry {
    Forward,
    Rollback,
    Stopped(TaskStatus, Vec<TaskId>),
}

/// What one forward transaction produced.
enum Progress {
    Continue,
    Emit(Reply),
    Finished(Reply),
}

/// Entry point for every task lifecycle operation.
pub struct TaskService<S> {
    store: S,
    oracle: Arc<dyn PermissionOracle>,
    machines: MachineRegistry,
    config: TaskConfig,
    policy: RetryPolicy,
    metrics: TaskMetrics,
}

impl<S: std::fmt::Debug> std::fmt::Debug for TaskService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("store", &self.store)
            .field("machines", &self.machines)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: ResourceStore> TaskService<S> {
    /// Creates a service with the ACL oracle and the standard state machines.
    #[must_use]
    pub fn new(store: S, config: TaskConfig) -> Self {
        Self {
            store,
            oracle: Arc::new(AclOracle::new()),
            machines: MachineRegistry::standard(),
            policy: RetryPolicy::from_config(&config),
            config,
            metrics: TaskMetrics::new(),
        }
    }

    /// Replaces the permission oracle.
    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn PermissionOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Replaces the state machine registry.
    #[must_use]
    pub fn with_machines(mut self, machines: MachineRegistry) -> Self {
        self.machines = machines;
        self
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Active configuration.
    pub const fn config(&self) -> &TaskConfig {
        &self.config
    }

    async fn transact<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&mut dyn Transaction) -> Result<T> + Send,
    {
        retry::transact(&self.store, &self.policy, &self.metrics, op).await
    }

    fn admit(&self, tx: &mut dyn Transaction, task: &mut Task, deps: &[Dependency]) -> Result<()> {
        let blocked = admission::admit(tx, task, deps)?;
        self.metrics.record_admission(blocked);
        Ok(())
    }

    // --- Initialization ---

    /// Starts a download of `ids` to `path` (`endpoint/dir`).
    ///
    /// With `check`, only classifies. No task is created when nothing has
    /// raw data to transfer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` for a path without endpoint, `TransferConflict`
    /// for duplicate original file names, and the preprocessor's errors.
    #[tracing::instrument(skip_all, fields(client = %client, ids = ids.len()))]
    pub async fn init_data_get(
        &self,
        client: &SubjectId,
        path: &str,
        encrypt: Encryption,
        ids: &[ItemRef],
        orig_fname: bool,
        check: bool,
    ) -> Result<Classified> {
        self.transact(|tx| {
            transfer::split_remote(path)?;
            let user = tx.require_user(client)?;
            let classification =
                preprocess::classify(tx, self.oracle.as_ref(), &user, None, ids, Mode::Get)?;
            transfer::plan_get(
                tx,
                &classification.managed,
                &classification.external,
                path,
                orig_fname,
            )?;

            if check || (classification.managed.is_empty() && classification.external.is_empty())
            {
                return Ok(Classified {
                    classification,
                    task: None,
                });
            }

            let deps = record_deps(
                classification.managed.iter().chain(&classification.external),
                false,
            );
            let mut task = Task::new(
                client.clone(),
                TaskPayload::DataGet(GetPayload {
                    path: path.to_string(),
                    encrypt,
                    orig_fname,
                    glob_data: classification.managed.clone(),
                    ext_data: classification.external.clone(),
                    xfr: Vec::new(),
                }),
                2,
            );
            self.admit(tx, &mut task, &deps)?;
            Ok(Classified {
                classification,
                task: Some(task),
            })
        })
        .await
    }

    /// Starts an upload from `path` (`endpoint/dir/file`) into the records.
    ///
    /// An explicit `ext` is stored with a leading dot and disables automatic
    /// extensions; otherwise the extension is derived from the file name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` for a malformed path, collections, or external
    /// records, plus the preprocessor's errors.
    #[tracing::instrument(skip_all, fields(client = %client, ids = ids.len()))]
    pub async fn init_data_put(
        &self,
        client: &SubjectId,
        path: &str,
        encrypt: Encryption,
        ext: Option<&str>,
        ids: &[ItemRef],
        check: bool,
    ) -> Result<Classified> {
        let ext = ext.map(str::trim).filter(|e| !e.is_empty()).map(|e| {
            if e.starts_with('.') {
                e.to_string()
            } else {
                format!(".{e}")
            }
        });

        self.transact(|tx| {
            let user = tx.require_user(client)?;
            let classification =
                preprocess::classify(tx, self.oracle.as_ref(), &user, None, ids, Mode::Put)?;
            if check || classification.managed.is_empty() {
                return Ok(Classified {
                    classification,
                    task: None,
                });
            }

            let (_, remote) = transfer::split_remote(path)?;
            if remote.ends_with('/') {
                return Err(Error::InvalidParam(
                    "invalid source path (must name a file)".into(),
                ));
            }

            let deps = record_deps(classification.managed.iter(), true);
            let mut task = Task::new(
                client.clone(),
                TaskPayload::DataPut(PutPayload {
                    path: path.to_string(),
                    encrypt,
                    ext: ext.clone(),
                    glob_data: classification.managed.clone(),
                    xfr: Vec::new(),
                    sizes: Vec::new(),
                }),
                2,
            );
            self.admit(tx, &mut task, &deps)?;
            Ok(Classified {
                classification,
                task: Some(task),
            })
        })
        .await
    }

    /// Starts creating an allocation for `subject` on `repo`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repo or subject, `PermissionDenied`
    /// unless the client administers the repo, `InvalidParam` when the
    /// allocation exists, and `InUse` for a duplicate pending task.
    #[tracing::instrument(skip_all, fields(client = %client, repo = %repo, subject = %subject))]
    pub async fn init_alloc_create(
        &self,
        client: &SubjectId,
        repo: &RepoId,
        subject: &SubjectId,
        data_limit: u64,
        rec_limit: u64,
    ) -> Result<Task> {
        self.transact(|tx| {
            let repo_doc = tx.require_repo(repo)?;
            ensure_subject(tx, subject)?;
            let user = tx.require_user(client)?;
            self.ensure_repo_admin(tx, &user, repo)?;

            if tx.allocation(subject, repo)?.is_some() {
                return Err(Error::InvalidParam(format!(
                    "subject '{subject}' already has an allocation on {repo}"
                )));
            }
            admission::ensure_no_duplicate(
                tx,
                crate::task::TaskType::AllocCreate,
                &ResourceId::from(repo),
                subject,
            )?;

            let mut task = Task::new(
                client.clone(),
                TaskPayload::AllocCreate(AllocPayload {
                    repo_id: repo.clone(),
                    subject: subject.clone(),
                    repo_path: repo_doc.subject_path(subject),
                    data_limit,
                    rec_limit,
                }),
                3,
            );
            self.admit(tx, &mut task, &alloc_deps(repo, subject))?;
            Ok(task)
        })
        .await
    }

    /// Starts deleting `subject`'s allocation on `repo`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repo, subject or allocation,
    /// `PermissionDenied` unless the client administers the repo, and `InUse`
    /// when records remain in the allocation or a duplicate task is pending.
    #[tracing::instrument(skip_all, fields(client = %client, repo = %repo, subject = %subject))]
    pub async fn init_alloc_delete(
        &self,
        client: &SubjectId,
        repo: &RepoId,
        subject: &SubjectId,
    ) -> Result<Task> {
        self.transact(|tx| {
            tx.require_repo(repo)?;
            ensure_subject(tx, subject)?;
            let user = tx.require_user(client)?;
            self.ensure_repo_admin(tx, &user, repo)?;

            let alloc = tx
                .allocation(subject, repo)?
                .ok_or_else(|| Error::not_found("allocation", format!("{subject} on {repo}")))?;
            if !tx.records_at(subject, repo)?.is_empty() {
                return Err(Error::InUse(
                    "cannot delete allocation - records present".into(),
                ));
            }
            admission::ensure_no_duplicate(
                tx,
                crate::task::TaskType::AllocDelete,
                &ResourceId::from(repo),
                subject,
            )?;

            let mut task = Task::new(
                client.clone(),
                TaskPayload::AllocDelete(AllocPayload {
                    repo_id: repo.clone(),
                    subject: subject.clone(),
                    repo_path: alloc.path,
                    data_limit: alloc.data_limit,
                    rec_limit: alloc.rec_limit,
                }),
                3,
            );
            self.admit(tx, &mut task, &alloc_deps(repo, subject))?;
            Ok(task)
        })
        .await
    }

    /// Starts moving `ids` into the owner's allocation on `dst_repo`. The
    /// owner is `project` when given, otherwise the client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` for an unknown project or repo or a missing
    /// allocation, `PermissionDenied` unless the client manages the project
    /// or when a selected record belongs to another subject, plus the
    /// preprocessor's errors.
    #[tracing::instrument(skip_all, fields(client = %client, dst_repo = %dst_repo, ids = ids.len()))]
    pub async fn init_rec_alloc_change(
        &self,
        client: &SubjectId,
        ids: &[ItemRef],
        dst_repo: &RepoId,
        project: Option<&SubjectId>,
        check: bool,
    ) -> Result<AllocChangeInit> {
        self.transact(|tx| {
            let user = tx.require_user(client)?;
            let owner = match project {
                Some(project) => {
                    if tx.project(project)?.is_none() {
                        return Err(Error::InvalidParam(format!(
                            "project '{project}' does not exist"
                        )));
                    }
                    if !self.oracle.is_project_manager(tx, &user, project)? {
                        return Err(Error::PermissionDenied(
                            "operation requires admin permissions to project".into(),
                        ));
                    }
                    project.clone()
                }
                None => client.clone(),
            };

            if tx.repo(dst_repo)?.is_none() {
                return Err(Error::InvalidParam(format!("no such repo '{dst_repo}'")));
            }
            let alloc = tx
                .allocation(&owner, dst_repo)?
                .ok_or_else(|| Error::InvalidParam(format!("no allocation on '{dst_repo}'")))?;

            let classification = preprocess::classify(
                tx,
                self.oracle.as_ref(),
                &user,
                None,
                ids,
                Mode::AllocChange,
            )?;
            if let Some(foreign) = classification
                .external
                .iter()
                .chain(&classification.managed)
                .find(|rec| rec.owner != owner)
            {
                return Err(Error::PermissionDenied(format!(
                    "record '{}' is owned by {}, not {owner}",
                    foreign.id, foreign.owner
                )));
            }

            let mut moving = Vec::new();
            let mut act_size = 0;
            for rec in &classification.managed {
                if let Some(loc) = tx.location(&rec.id)? {
                    if &loc.repo != dst_repo {
                        act_size += rec.size;
                        moving.push(rec);
                    }
                }
            }

            let mut result = AllocChangeInit {
                tot_cnt: classification.managed.len() + classification.external.len(),
                act_cnt: moving.len(),
                act_size,
                data_limit: alloc.data_limit,
                data_size: alloc.data_size,
                rec_limit: alloc.rec_limit,
                rec_count: alloc.rec_count,
                task: None,
            };
            if moving.is_empty() || check {
                return Ok(result);
            }

            let mut deps = record_deps(moving.iter().copied(), true);
            deps.push(Dependency::exclusive(dst_repo).in_context(&owner));
            let mut task = Task::new(
                client.clone(),
                TaskPayload::RecAllocChange(MovePayload {
                    owner,
                    dst_repo: dst_repo.clone(),
                    dst_coll: None,
                    glob_data: classification.managed,
                    ext_data: Vec::new(),
                    xfr: Vec::new(),
                }),
                2,
            );
            self.admit(tx, &mut task, &deps)?;
            result.task = Some(task);
            Ok(result)
        })
        .await
    }

    /// Starts moving `ids` to the owner of `dst_coll`, storing managed data
    /// on `dst_repo`.
    ///
    /// With `check`, returns the new owner's allocations so a repository can
    /// be chosen, and `dst_repo` may be `None`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` for an unknown collection or repo or a missing
    /// allocation, `PermissionDenied` without CREATE on the destination,
    /// without any allocation (check mode) or when the selection contains
    /// public data, plus the preprocessor's errors.
    #[tracing::instrument(skip_all, fields(client = %client, dst_coll = %dst_coll, ids = ids.len()))]
    pub async fn init_rec_owner_change(
        &self,
        client: &SubjectId,
        ids: &[ItemRef],
        dst_coll: &CollectionId,
        dst_repo: Option<&RepoId>,
        check: bool,
    ) -> Result<OwnerChangeInit> {
        self.transact(|tx| {
            let user = tx.require_user(client)?;
            let coll = tx
                .collection(dst_coll)?
                .ok_or_else(|| Error::InvalidParam(format!("no such collection '{dst_coll}'")))?;
            let owner = coll.owner.clone();

            if owner != user.id {
                let manages = owner.is_project()
                    && self.oracle.is_project_manager(tx, &user, &owner)?;
                if !manages
                    && !self.oracle.has_permissions(
                        tx,
                        &user,
                        &ItemRef::Collection(dst_coll.clone()),
                        perm::CREATE,
                        false,
                    )?
                {
                    return Err(Error::PermissionDenied(format!(
                        "operation requires CREATE permission on destination collection '{dst_coll}'"
                    )));
                }
            }

            let mut allocs = Vec::new();
            let dst_repo = if check {
                allocs = tx.allocations_of(&owner)?;
                if allocs.is_empty() {
                    return Err(Error::PermissionDenied(format!(
                        "no allocations available for '{owner}'"
                    )));
                }
                allocs.sort_by(|a, b| a.repo.cmp(&b.repo));
                None
            } else {
                let repo = dst_repo.ok_or_else(|| {
                    Error::InvalidParam("destination repository required".into())
                })?;
                if tx.repo(repo)?.is_none() {
                    return Err(Error::InvalidParam(format!("no such repo '{repo}'")));
                }
                if tx.allocation(&owner, repo)?.is_none() {
                    return Err(Error::InvalidParam(format!("no allocation on '{repo}'")));
                }
                Some(repo.clone())
            };

            let classification = preprocess::classify(
                tx,
                self.oracle.as_ref(),
                &user,
                Some(&owner),
                ids,
                Mode::OwnerChange,
            )?;
            if classification.has_public {
                return Err(Error::PermissionDenied(
                    "owner change not allowed - selection contains public data".into(),
                ));
            }

            let mut deps = Vec::new();
            let mut act_size = 0;
            for rec in &classification.external {
                if rec.owner != owner {
                    deps.push(Dependency::exclusive(&rec.id));
                }
            }
            for rec in &classification.managed {
                let Some(loc) = tx.location(&rec.id)? else {
                    continue;
                };
                if loc.uid != owner || Some(&loc.repo) != dst_repo.as_ref() {
                    deps.push(Dependency::exclusive(&rec.id));
                    act_size += rec.size;
                }
            }

            let mut result = OwnerChangeInit {
                tot_cnt: classification.managed.len() + classification.external.len(),
                act_cnt: deps.len(),
                act_size,
                allocs,
                task: None,
            };
            let Some(dst_repo) = dst_repo.filter(|_| !deps.is_empty()) else {
                return Ok(result);
            };

            deps.push(Dependency::shared(dst_coll));
            deps.push(Dependency::shared(&owner));
            deps.push(Dependency::exclusive(&dst_repo).in_context(&owner));

            let mut task = Task::new(
                client.clone(),
                TaskPayload::RecOwnerChange(MovePayload {
                    owner,
                    dst_repo,
                    dst_coll: Some(dst_coll.clone()),
                    glob_data: classification.managed,
                    ext_data: classification.external,
                    xfr: Vec::new(),
                }),
                3,
            );
            self.admit(tx, &mut task, &deps)?;
            result.task = Some(task);
            Ok(result)
        })
        .await
    }

    /// Starts deleting records and collections.
    ///
    /// Deleted items are unlinked from their parents immediately; metadata
    /// and raw data are removed by the task.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when the selection contains public data,
    /// `InUse` when a task holds a lock on any deleted record, plus the
    /// preprocessor's errors.
    #[tracing::instrument(skip_all, fields(client = %client, ids = ids.len()))]
    pub async fn init_rec_coll_delete(
        &self,
        client: &SubjectId,
        ids: &[ItemRef],
    ) -> Result<Classified> {
        self.transact(|tx| {
            let user = tx.require_user(client)?;
            let classification =
                preprocess::classify(tx, self.oracle.as_ref(), &user, None, ids, Mode::Delete)?;
            if classification.has_public {
                return Err(Error::PermissionDenied(
                    "deletion not allowed - selection contains public data".into(),
                ));
            }

            let records = classification.record_ids();
            let resources: Vec<ResourceId> = records.iter().map(ResourceId::from).collect();
            admission::ensure_exclusive_access(tx, &resources)?;

            for coll in &classification.collections {
                let item = ItemRef::Collection(coll.clone());
                for parent in tx.parents(&item)? {
                    tx.unlink(&parent, &item)?;
                }
            }
            for id in &records {
                let item = ItemRef::Record(id.clone());
                for parent in tx.parents(&item)? {
                    tx.unlink(&parent, &item)?;
                }
            }

            let deps: Vec<Dependency> = resources
                .iter()
                .cloned()
                .chain(classification.collections.iter().map(ResourceId::from))
                .map(Dependency::exclusive)
                .collect();
            let mut task = Task::new(
                client.clone(),
                TaskPayload::RecCollDelete(DeletePayload {
                    collections: classification.collections.clone(),
                    records,
                    del_data: Vec::new(),
                }),
                2,
            );
            self.admit(tx, &mut task, &deps)?;
            Ok(Classified {
                classification,
                task: Some(task),
            })
        })
        .await
    }

    /// Starts deleting projects with everything they own. Membership is
    /// revoked immediately.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` for an unknown project, `PermissionDenied`
    /// unless the client administers every project, and `InUse` when a task
    /// holds a lock on any of them.
    #[tracing::instrument(skip_all, fields(client = %client, projects = projects.len()))]
    pub async fn init_proj_delete(&self, client: &SubjectId, projects: &[SubjectId]) -> Result<Task> {
        self.transact(|tx| {
            let user = tx.require_user(client)?;
            for id in projects {
                if tx.project(id)?.is_none() {
                    return Err(Error::InvalidParam(format!("no such project '{id}'")));
                }
                if !self.oracle.is_project_admin(tx, &user, id)? {
                    return Err(Error::PermissionDenied(format!(
                        "operation requires admin permissions to project '{id}'"
                    )));
                }
            }

            let resources: Vec<ResourceId> = projects.iter().map(ResourceId::from).collect();
            admission::ensure_exclusive_access(tx, &resources)?;

            for id in projects {
                let mut project = tx.require_project(id)?;
                project.admins.clear();
                project.members.clear();
                tx.put_project(project)?;
            }

            let deps: Vec<Dependency> = resources.into_iter().map(Dependency::exclusive).collect();
            let mut task = Task::new(
                client.clone(),
                TaskPayload::ProjDelete(ProjDeletePayload {
                    projects: projects.to_vec(),
                    allocs: Vec::new(),
                }),
                2,
            );
            self.admit(tx, &mut task, &deps)?;
            Ok(task)
        })
        .await
    }

    fn ensure_repo_admin(&self, tx: &dyn Transaction, user: &User, repo: &RepoId) -> Result<()> {
        if self.oracle.is_repo_admin(tx, user, repo)? {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "operation requires admin permissions to repository '{repo}'"
            )))
        }
    }

    // --- Execution ---

    /// Advances a task.
    ///
    /// `confirmed_step` confirms the step of the last command; it is `None`
    /// on the first call and when resuming after a restart. An
    /// `external_error` reports a command that failed permanently and
    /// triggers rollback.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` for a task that is not runnable or a confirmed
    /// step that does not match, and `NotFound` for an unknown task. Step
    /// failures do not surface here; they fail the task.
    #[tracing::instrument(skip_all, fields(task_id = %task_id, step = ?confirmed_step))]
    pub async fn run(
        &self,
        task_id: &TaskId,
        confirmed_step: Option<i64>,
        external_error: Option<&str>,
    ) -> Result<Reply> {
        let (entry, task_type) = self
            .transact(|tx| self.enter(tx, task_id, confirmed_step, external_error))
            .await?;
        let _timer = time_step(task_type.as_label());

        match entry {
            Entry::Stopped(from, ready) => {
                self.metrics
                    .record_transition(from.as_label(), TaskStatus::Failed.as_label());
                Ok(Reply::stop(ready))
            }
            Entry::Rollback => self.roll_back(task_id).await,
            Entry::Forward => self.forward(task_id).await,
        }
    }

    fn enter(
        &self,
        tx: &mut dyn Transaction,
        task_id: &TaskId,
        confirmed_step: Option<i64>,
        external_error: Option<&str>,
    ) -> Result<(Entry, crate::task::TaskType)> {
        let mut task = tx.require_task(task_id)?;
        let task_type = task.task_type;
        if !task.status.is_runnable() {
            return Err(Error::InvalidParam(format!(
                "called run on task {task_id} with incorrect status: {}",
                task.status
            )));
        }

        if let Some(err) = external_error {
            tracing::warn!(error = err, step = task.step, "worker reported failure");
            if task.step == 0 {
                let from = task.status;
                let ready = admission::complete(tx, task_id, false, Some(err))?;
                return Ok((Entry::Stopped(from, ready), task_type));
            }
            if task.step > 0 {
                task.step = -task.step;
                task.error = Some(err.to_string());
                task.touch();
                tx.put_task(task)?;
            }
            return Ok((Entry::Rollback, task_type));
        }
        if task.is_rolling_back() {
            return Ok((Entry::Rollback, task_type));
        }

        match confirmed_step {
            Some(step) => {
                if task.status != TaskStatus::Running || step != task.step {
                    return Err(Error::InvalidParam(format!(
                        "called run on task {task_id} with invalid step: {step} (expected {})",
                        task.step
                    )));
                }
                task.step += 1;
                task.touch();
            }
            None if task.status == TaskStatus::Ready => {
                task.transition_to(TaskStatus::Running, MSG_RUNNING)?;
                self.metrics
                    .record_transition(TaskStatus::Ready.as_label(), TaskStatus::Running.as_label());
            }
            None => {}
        }
        tx.put_task(task)?;
        Ok((Entry::Forward, task_type))
    }

    async fn forward(&self, task_id: &TaskId) -> Result<Reply> {
        loop {
            match self.transact(|tx| self.forward_step(tx, task_id)).await {
                Ok(Progress::Continue) => {}
                Ok(Progress::Emit(reply)) => {
                    self.metrics.record_command(reply.command.as_label());
                    return Ok(reply);
                }
                Ok(Progress::Finished(reply)) => {
                    self.metrics.record_transition(
                        TaskStatus::Running.as_label(),
                        TaskStatus::Succeeded.as_label(),
                    );
                    return Ok(reply);
                }
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "task step failed");
                    let message = err.to_string();
                    let failed = self
                        .transact(|tx| {
                            let mut task = tx.require_task(task_id)?;
                            if task.step <= 0 {
                                return admission::complete(tx, task_id, false, Some(&message))
                                    .map(Some);
                            }
                            task.step = -task.step;
                            task.error = Some(message.clone());
                            task.touch();
                            tx.put_task(task)?;
                            Ok(None)
                        })
                        .await?;
                    return match failed {
                        Some(ready) => {
                            self.metrics.record_transition(
                                TaskStatus::Running.as_label(),
                                TaskStatus::Failed.as_label(),
                            );
                            Ok(Reply::stop(ready))
                        }
                        None => self.roll_back(task_id).await,
                    };
                }
            }
        }
    }

    fn forward_step(&self, tx: &mut dyn Transaction, task_id: &TaskId) -> Result<Progress> {
        let mut task = tx.require_task(task_id)?;
        if task.status != TaskStatus::Running {
            return Err(Error::InvalidParam(format!(
                "task {task_id} is {} and cannot advance",
                task.status
            )));
        }
        let runner = self.machines.get(task.task_type)?;
        let step = task.step;

        if step == 0 {
            let steps = runner.plan(&mut StepContext {
                tx: &mut *tx,
                task: &mut task,
                config: &self.config,
                metrics: &self.metrics,
            })?;
            tracing::debug!(steps, "planned task");
            task.steps = steps;
            task.step = 1;
            task.touch();
            tx.put_task(task)?;
            return Ok(Progress::Continue);
        }

        if step >= task.steps - 1 {
            tx.put_task(task.clone())?;
            let ready = runner.finalize(&mut StepContext {
                tx: &mut *tx,
                task: &mut task,
                config: &self.config,
                metrics: &self.metrics,
            })?;
            return Ok(Progress::Finished(Reply::stop(ready)));
        }

        let outcome = runner.step(
            &mut StepContext {
                tx: &mut *tx,
                task: &mut task,
                config: &self.config,
                metrics: &self.metrics,
            },
            step,
        )?;
        task.touch();
        match outcome {
            StepOutcome::Advance => {
                task.step += 1;
                tx.put_task(task)?;
                Ok(Progress::Continue)
            }
            StepOutcome::Command(command) => {
                task.message = format!("Running step {step} of {}", task.steps);
                tx.put_task(task)?;
                Ok(Progress::Emit(Reply::command(command, step)))
            }
        }
    }

    async fn roll_back(&self, task_id: &TaskId) -> Result<Reply> {
        let result = self.transact(|tx| self.roll_back_all(tx, task_id)).await;
        let ready = match result {
            Ok(ready) => ready,
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                tracing::error!(error = %err, "rollback failed");
                self.transact(|tx| {
                    let task = tx.require_task(task_id)?;
                    let message = format!(
                        "{} (Rollback failed: {err})",
                        task.error.as_deref().unwrap_or(MSG_FAILED_UNKNOWN)
                    );
                    admission::complete(tx, task_id, false, Some(&message))
                })
                .await?
            }
        };
        self.metrics
            .record_transition(TaskStatus::Running.as_label(), TaskStatus::Failed.as_label());
        Ok(Reply::stop(ready))
    }

    fn roll_back_all(&self, tx: &mut dyn Transaction, task_id: &TaskId) -> Result<Vec<TaskId>> {
        let mut task = tx.require_task(task_id)?;
        let runner = self.machines.get(task.task_type)?;
        let from = -task.step;
        {
            let mut ctx = StepContext {
                tx: &mut *tx,
                task: &mut task,
                config: &self.config,
                metrics: &self.metrics,
            };
            for step in (1..=from).rev() {
                runner.rollback(&mut ctx, step)?;
            }
        }
        tracing::info!(from, "rolled back task");
        admission::complete(tx, task_id, false, task.error.as_deref())
    }

    // --- Lifecycle queries ---

    /// Fails a task that has not finished and returns the tasks it unblocked.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown task and `InvalidParam` when it
    /// already finished.
    #[tracing::instrument(skip_all, fields(task_id = %task_id))]
    pub async fn abort(&self, task_id: &TaskId, reason: Option<&str>) -> Result<Vec<TaskId>> {
        let ready = self
            .transact(|tx| admission::complete(tx, task_id, false, reason))
            .await?;
        tracing::info!(promoted = ready.len(), "task aborted");
        Ok(ready)
    }

    /// Returns a task with its block edges.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown task.
    pub fn view(&self, task_id: &TaskId) -> Result<TaskView> {
        let tx = self.store.begin()?;
        let task = tx.require_task(task_id)?;
        let (blocked_by, blocking) = admission::edges_of(tx.as_ref(), task_id)?;
        Ok(TaskView {
            task,
            blocked_by,
            blocking,
        })
    }

    /// Lists the client's tasks, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list(&self, client: &SubjectId, filter: &ListFilter) -> Result<Vec<Task>> {
        let tx = self.store.begin()?;
        let (from, to) = match filter.since {
            Some(since) => {
                let window = chrono::Duration::from_std(since)
                    .map_err(|e| Error::InvalidParam(format!("invalid window: {e}")))?;
                (Some(Utc::now() - window), None)
            }
            None => (filter.from, filter.to),
        };

        let mut tasks: Vec<Task> = tx
            .tasks()?
            .into_iter()
            .filter(|t| &t.client == client)
            .filter(|t| filter.status.is_empty() || filter.status.contains(&t.status))
            .filter(|t| from.map_or(true, |from| t.updated_at >= from))
            .filter(|t| to.map_or(true, |to| t.updated_at <= to))
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(tasks
            .into_iter()
            .skip(filter.offset)
            .take(filter.count.unwrap_or(usize::MAX))
            .collect())
    }

    /// Ids of READY and RUNNING tasks, RUNNING first, for a driver restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn reload(&self) -> Result<Vec<TaskId>> {
        let tx = self.store.begin()?;
        let mut tasks: Vec<Task> = tx
            .tasks()?
            .into_iter()
            .filter(|t| t.status.is_runnable())
            .collect();
        tasks.sort_by_key(|t| (t.status != TaskStatus::Running, t.created_at));
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// Deletes finished tasks last updated before `older_than` ago and
    /// returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self, older_than: Duration) -> Result<usize> {
        let window = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::InvalidParam(format!("invalid purge age: {e}")))?;
        let cutoff = Utc::now() - window;

        let purged = self
            .transact(|tx| {
                let stale: Vec<TaskId> = tx
                    .tasks()?
                    .into_iter()
                    .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
                    .map(|t| t.id)
                    .collect();
                for id in &stale {
                    remove_task(tx, id)?;
                }
                Ok(stale.len())
            })
            .await?;
        tracing::info!(purged, "purged finished tasks");
        Ok(purged)
    }

    /// Deletes one finished task.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown task and `InUse` while it has not
    /// finished.
    #[tracing::instrument(skip_all, fields(task_id = %task_id))]
    pub async fn delete_task(&self, task_id: &TaskId) -> Result<()> {
        self.transact(|tx| {
            let task = tx.require_task(task_id)?;
            if !task.status.is_terminal() {
                return Err(Error::InUse(format!("task {task_id} has not finished")));
            }
            remove_task(tx, task_id)
        })
        .await
    }
}

fn remove_task(tx: &mut dyn Transaction, id: &TaskId) -> Result<()> {
    for waiter in tx.waiting_on(id)? {
        tx.remove_block(&admission::BlockEdge {
            blocked: waiter,
            blocker: *id,
        })?;
    }
    for blocker in tx.blockers_of(id)? {
        tx.remove_block(&admission::BlockEdge {
            blocked: *id,
            blocker,
        })?;
    }
    tx.remove_locks_held_by(id)?;
    tx.remove_task(id)
}

fn ensure_subject(tx: &dyn Transaction, subject: &SubjectId) -> Result<()> {
    if tx.subject_exists(subject)? {
        Ok(())
    } else {
        Err(Error::not_found("subject", subject))
    }
}

/// Locks the repo exclusively for one subject and the subject for reading.
fn alloc_deps(repo: &RepoId, subject: &SubjectId) -> Vec<Dependency> {
    vec![
        Dependency::exclusive(repo).in_context(subject),
        Dependency::shared(subject),
    ]
}

/// Locks each record (exclusively when `exclusive`) and each distinct owner
/// for reading.
fn record_deps<'a>(
    records: impl Iterator<Item = &'a ClassifiedRecord>,
    exclusive: bool,
) -> Vec<Dependency> {
    let mut deps = Vec::new();
    let mut owners = BTreeSet::new();
    for rec in records {
        deps.push(if exclusive {
            Dependency::exclusive(&rec.id)
        } else {
            Dependency::shared(&rec.id)
        });
        owners.insert(rec.owner.clone());
    }
    deps.extend(owners.into_iter().map(Dependency::shared));
    deps
}
