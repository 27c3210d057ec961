//! # datafed-core
//!
//! Core primitives shared by DataFed services.
//!
//! This crate provides the foundational types used across components:
//!
//! - **Identifiers**: ULID task ids and prefixed keys for records, collections,
//!   repositories, subjects and groups
//! - **Permissions**: Access bit constants used by the permission oracle
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Task span helpers
//!
//! ## Example
//!
//! ```rust
//! use datafed_core::prelude::*;
//!
//! let task = TaskId::generate();
//! let record = RecordId::from_key("1234");
//! assert_eq!(record.as_str(), "d/1234");
//! assert!(!task.to_string().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod perm;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use datafed_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        CollectionId, GroupId, RecordId, RepoId, ResourceId, SubjectId, TaskId,
    };
    pub use crate::perm;
}

pub use error::{Error, Result};
pub use id::{CollectionId, GroupId, RecordId, RepoId, ResourceId, SubjectId, TaskId};
pub use observability::task_span;
