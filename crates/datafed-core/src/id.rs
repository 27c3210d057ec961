//! Strongly-typed identifiers for DataFed entities.
//!
//! Tasks use ULIDs so they sort by creation time and need no coordination to
//! generate. Catalog resources keep the prefixed string keys used by the
//! resource graph (`d/…` for data records, `c/…` for collections and so on);
//! each prefix gets its own newtype so a collection id can never be passed
//! where a record id is expected.
//!
//! # Example
//!
//! ```rust
//! use datafed_core::id::{CollectionId, RecordId, ResourceId};
//!
//! let rec = RecordId::from_key("42");
//! let coll: CollectionId = "c/root".parse().unwrap();
//!
//! assert_eq!(rec.key(), "42");
//! assert_eq!(ResourceId::from(&coll).as_str(), "c/root");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for an orchestration task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    /// Generates a new unique task ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        i64::try_from(self.0.timestamp_ms())
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::invalid_id(format!("invalid task ID '{s}': {e}")))
    }
}

/// An untyped reference to any resource in the graph.
///
/// Lock edges point at records, collections, repositories, subjects and
/// projects alike, so they carry this form instead of a typed id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a resource id from its full string form.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the full id including its prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn split_prefixed<'a>(s: &'a str, prefix: &str, label: &str) -> Result<&'a str> {
    match s.strip_prefix(prefix) {
        Some(key) if !key.is_empty() && !key.contains('/') => Ok(key),
        _ => Err(Error::invalid_id(format!(
            "invalid {label} ID '{s}': expected '{prefix}<key>'"
        ))),
    }
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Prefix carried by every id of this kind.
            pub const PREFIX: &'static str = $prefix;

            /// Builds an id from a bare key.
            #[must_use]
            pub fn from_key(key: &str) -> Self {
                Self(format!("{}{key}", $prefix))
            }

            /// Returns the key without its prefix.
            #[must_use]
            pub fn key(&self) -> &str {
                &self.0[$prefix.len()..]
            }

            /// Returns the full id including its prefix.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                split_prefixed(s, $prefix, $label).map(|_| Self(s.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                split_prefixed(&s, $prefix, $label)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl From<&$name> for ResourceId {
            fn from(id: &$name) -> Self {
                ResourceId(id.0.clone())
            }
        }

        impl From<$name> for ResourceId {
            fn from(id: $name) -> Self {
                ResourceId(id.0)
            }
        }
    };
}

prefixed_id!(
    /// Identifier of a data record (`d/<key>`).
    RecordId,
    "d/",
    "record"
);

prefixed_id!(
    /// Identifier of a collection (`c/<key>`).
    CollectionId,
    "c/",
    "collection"
);

prefixed_id!(
    /// Identifier of a storage repository (`repo/<key>`).
    RepoId,
    "repo/",
    "repository"
);

prefixed_id!(
    /// Identifier of a user group (`g/<key>`).
    GroupId,
    "g/",
    "group"
);

/// Identifier of a subject that can own data: a user (`u/<key>`) or a
/// project (`p/<key>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    /// Builds a user subject id.
    #[must_use]
    pub fn user(key: &str) -> Self {
        Self(format!("u/{key}"))
    }

    /// Builds a project subject id.
    #[must_use]
    pub fn project(key: &str) -> Self {
        Self(format!("p/{key}"))
    }

    /// Returns true for project subjects.
    #[must_use]
    pub fn is_project(&self) -> bool {
        self.0.starts_with("p/")
    }

    /// Returns the key without its prefix.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.0[2..]
    }

    /// Returns the full id including its prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the namespace prefix used for aliases owned by this subject,
    /// e.g. `u:alice:`.
    #[must_use]
    pub fn alias_prefix(&self) -> String {
        let kind = if self.is_project() { 'p' } else { 'u' };
        format!("{kind}:{}:", self.key())
    }

    /// Returns the storage sub-directory that holds this subject's data
    /// inside a repository, e.g. `user/alice/`.
    #[must_use]
    pub fn storage_dir(&self) -> String {
        let kind = if self.is_project() { "project" } else { "user" };
        format!("{kind}/{}/", self.key())
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SubjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        split_prefixed(s, "u/", "subject")
            .or_else(|_| split_prefixed(s, "p/", "subject"))
            .map(|_| Self(s.to_string()))
    }
}

impl TryFrom<String> for SubjectId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SubjectId> for String {
    fn from(id: SubjectId) -> Self {
        id.0
    }
}

impl From<&SubjectId> for ResourceId {
    fn from(id: &SubjectId) -> Self {
        ResourceId(id.0.clone())
    }
}

impl From<SubjectId> for ResourceId {
    fn from(id: SubjectId) -> Self {
        ResourceId(id.0)
    }
}
