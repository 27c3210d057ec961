//! Worker-side loop that executes task commands.
//!
//! The driver calls [`TaskService::run`], hands each emitted command to a
//! [`CommandExecutor`], and confirms the step once the command succeeded.
//! Commands that keep failing are reported back as external errors, which
//! roll the task back.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use datafed_core::{task_span, TaskId};

use crate::error::{Error, Result};
use crate::service::TaskService;
use crate::store::ResourceStore;
use crate::task::Command;

/// Why a worker command failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailure {
    /// Message reported to the task.
    pub message: String,
    /// When true, the driver reports the failure without retrying.
    pub permanent: bool,
}

impl CommandFailure {
    /// A failure worth retrying.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// A failure that retrying cannot fix.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }
}

/// Executes worker commands: raw data transfers, deletes, size updates and
/// allocation storage changes.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Executes `command` for `task_id`.
    async fn execute(&self, task_id: &TaskId, command: &Command)
        -> std::result::Result<(), CommandFailure>;
}

/// An executor whose commands always succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpExecutor;

#[async_trait]
impl CommandExecutor for NoOpExecutor {
    async fn execute(
        &self,
        _task_id: &TaskId,
        _command: &Command,
    ) -> std::result::Result<(), CommandFailure> {
        Ok(())
    }
}

/// Drives tasks to completion against one executor.
pub struct TaskDriver<S, E> {
    service: Arc<TaskService<S>>,
    executor: E,
}

impl<S: std::fmt::Debug, E> std::fmt::Debug for TaskDriver<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDriver")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl<S, E> TaskDriver<S, E>
where
    S: ResourceStore,
    E: CommandExecutor,
{
    /// Creates a driver.
    pub const fn new(service: Arc<TaskService<S>>, executor: E) -> Self {
        Self { service, executor }
    }

    /// The executor.
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    /// Runs one task until it stops and returns the tasks its completion
    /// unblocked.
    ///
    /// # Errors
    ///
    /// Returns the service's error when a run call is rejected or keeps
    /// conflicting.
    #[tracing::instrument(skip_all, fields(task_id = %task_id))]
    pub async fn drive(&self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        let mut reply = self.service.run(task_id, None, None).await?;
        loop {
            if let Command::Stop(ready) = reply.command {
                return Ok(ready);
            }
            let step = reply
                .step
                .ok_or_else(|| Error::InternalFault("command reply without step".into()))?;

            reply = match self.execute(task_id, &reply.command).await {
                Ok(()) => self.service.run(task_id, Some(step), None).await?,
                Err(failure) => {
                    tracing::warn!(step, error = %failure, "command failed");
                    self.service
                        .run(task_id, None, Some(failure.message.as_str()))
                        .await?
                }
            };
        }
    }

    async fn execute(
        &self,
        task_id: &TaskId,
        command: &Command,
    ) -> std::result::Result<(), CommandFailure> {
        let config = self.service.config();
        let mut attempt = 0;
        let mut backoff = config.retry_base_delay;

        loop {
            attempt += 1;
            let failure = match self
                .executor
                .execute(task_id, command)
                .instrument(task_span(command.as_label(), task_id))
                .await
            {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };
            if failure.permanent || attempt >= config.command_max_attempts {
                return Err(failure);
            }
            tracing::debug!(
                attempt,
                command = command.as_label(),
                error = %failure,
                "retrying command"
            );
            tokio::time::sleep(backoff.min(config.retry_max_delay)).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    /// Drives every runnable task, then every task their completions
    /// unblocked, until none remain. Returns the driven ids in order.
    ///
    /// A task the service rejects is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or a run call keeps conflicting.
    pub async fn drain(&self) -> Result<Vec<TaskId>> {
        let mut queue: VecDeque<TaskId> = self.service.reload()?.into();
        let mut seen: HashSet<TaskId> = queue.iter().copied().collect();
        let mut driven = Vec::new();

        while let Some(task_id) = queue.pop_front() {
            match self.drive(&task_id).await {
                Ok(ready) => {
                    for id in ready {
                        if seen.insert(id) {
                            queue.push_back(id);
                        }
                    }
                }
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    tracing::error!(task_id = %task_id, error = %err, "skipping task");
                }
            }
            driven.push(task_id);
        }
        tracing::info!(tasks = driven.len(), "drained task queue");
        Ok(driven)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::model::{Repo, User};
    use crate::store::memory::InMemoryStore;
    use crate::task::TaskStatus;
    use datafed_core::{RepoId, SubjectId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        commands: Mutex<Vec<&'static str>>,
        fail_all: bool,
    }

    #[async_trait]
    impl CommandExecutor for Recording {
        async fn execute(
            &self,
            _task_id: &TaskId,
            command: &Command,
        ) -> std::result::Result<(), CommandFailure> {
            self.commands.lock().unwrap().push(command.as_label());
            if self.fail_all {
                Err(CommandFailure::transient("storage offline"))
            } else {
                Ok(())
            }
        }
    }

    fn seeded_service() -> Arc<TaskService<InMemoryStore>> {
        let store = InMemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.put_user(User::new("admin", "Admin")).unwrap();
        tx.put_user(User::new("bob", "Bob")).unwrap();
        tx.put_repo(Repo {
            id: RepoId::from_key("store1"),
            title: "Store 1".into(),
            endpoint: "ep1".into(),
            path: "/data/".into(),
            admins: [SubjectId::user("admin")].into(),
        })
        .unwrap();
        tx.commit().unwrap();

        let mut config = TaskConfig::default();
        config.retry_base_delay = std::time::Duration::from_millis(1);
        config.retry_max_delay = std::time::Duration::from_millis(2);
        Arc::new(TaskService::new(store, config))
    }

    #[tokio::test]
    async fn drives_allocation_create_to_success() {
        let service = seeded_service();
        let repo = RepoId::from_key("store1");
        let bob = SubjectId::user("bob");
        let task = service
            .init_alloc_create(&SubjectId::user("admin"), &repo, &bob, 1_000, 10)
            .await
            .unwrap();

        let driver = TaskDriver::new(Arc::clone(&service), Recording::default());
        let ready = driver.drive(&task.id).await.unwrap();
        assert!(ready.is_empty());
        assert_eq!(*driver.executor().commands.lock().unwrap(), vec!["alloc_create"]);

        let view = service.view(&task.id).unwrap();
        assert_eq!(view.task.status, TaskStatus::Succeeded);
        let tx = service.store().begin().unwrap();
        assert!(tx.allocation(&bob, &repo).unwrap().is_some());
    }

    #[tokio::test]
    async fn exhausted_command_retries_fail_the_task() {
        let service = seeded_service();
        let repo = RepoId::from_key("store1");
        let bob = SubjectId::user("bob");
        let task = service
            .init_alloc_create(&SubjectId::user("admin"), &repo, &bob, 1_000, 10)
            .await
            .unwrap();

        let executor = Recording {
            fail_all: true,
            ..Recording::default()
        };
        let driver = TaskDriver::new(Arc::clone(&service), executor);
        driver.drive(&task.id).await.unwrap();

        assert_eq!(driver.executor().commands.lock().unwrap().len(), 3);
        let view = service.view(&task.id).unwrap();
        assert_eq!(view.task.status, TaskStatus::Failed);
        assert_eq!(view.task.error.as_deref(), Some("storage offline"));
        let tx = service.store().begin().unwrap();
        assert!(tx.allocation(&bob, &repo).unwrap().is_none());
    }
}
