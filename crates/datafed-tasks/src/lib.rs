//! # datafed-tasks
//!
//! Task orchestration for DataFed: the long-running operations that move,
//! delete or allocate raw data on behalf of users and projects.
//!
//! This crate provides:
//!
//! - **Admission control**: tasks take shared or exclusive locks on the
//!   resources they touch and wait behind conflicting tasks
//! - **Preprocessing**: a permission-checked walk that expands records and
//!   collections into the records a task acts on
//! - **Transfer planning**: size-bounded chunks of files per source or
//!   destination repository
//! - **Resumable state machines**: each task advances one persisted step at
//!   a time and rolls back when a step fails
//!
//! ## Core Concepts
//!
//! - **Task**: a persisted unit of work with a signed step counter. A
//!   negative step means the task is unwinding
//! - **Command**: work for an external worker (transfer, delete, size update,
//!   allocation storage). The worker confirms the step when it is done
//! - **Lock / block edges**: admission bookkeeping stored next to the tasks
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use datafed_core::{RepoId, SubjectId};
//! use datafed_tasks::prelude::*;
//! use datafed_tasks::store::memory::InMemoryStore;
//!
//! # async fn example() -> Result<()> {
//! let service = Arc::new(TaskService::new(InMemoryStore::new(), TaskConfig::default()));
//! let task = service
//!     .init_alloc_create(
//!         &SubjectId::user("admin"),
//!         &RepoId::from_key("store1"),
//!         &SubjectId::user("bob"),
//!         10_000_000_000,
//!         1_000,
//!     )
//!     .await?;
//!
//! let driver = TaskDriver::new(service, NoOpExecutor);
//! let unblocked = driver.drive(&task.id).await?;
//! # let _ = unblocked;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod config;
pub mod driver;
pub mod error;
pub mod machines;
pub mod metrics;
pub mod model;
pub mod permissions;
pub mod preprocess;
pub mod record_move;
pub mod retry;
pub mod service;
pub mod store;
pub mod task;
pub mod transfer;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::admission::{Dependency, LockEdge};
    pub use crate::config::TaskConfig;
    pub use crate::driver::{CommandExecutor, CommandFailure, NoOpExecutor, TaskDriver};
    pub use crate::error::{Error, Result};
    pub use crate::machines::{MachineRegistry, StepRunner};
    pub use crate::metrics::TaskMetrics;
    pub use crate::model::ItemRef;
    pub use crate::permissions::{AclOracle, PermissionOracle};
    pub use crate::preprocess::{Classification, Mode};
    pub use crate::service::{ListFilter, TaskService, TaskView};
    pub use crate::store::{ResourceStore, Transaction};
    pub use crate::task::{Command, Encryption, Reply, Task, TaskPayload, TaskStatus, TaskType};
}
