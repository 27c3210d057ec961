//! Catalog resources read and written by tasks.
//!
//! These mirror the documents and edges of the resource graph: subjects,
//! repositories, allocations, records, collections, record locations and
//! access control entries.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datafed_core::{CollectionId, GroupId, RecordId, RepoId, ResourceId, SubjectId};

/// Access tokens stored for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Access token handed to the transfer service.
    pub access: String,
    /// Refresh token.
    pub refresh: String,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

/// A platform user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id (`u/<key>`).
    pub id: SubjectId,
    /// Display name.
    pub name: String,
    /// Global administrators pass every permission check.
    pub is_admin: bool,
    /// Stored transfer credentials, if the user linked an account.
    pub tokens: Option<TokenSet>,
}

impl User {
    /// Creates a regular user.
    #[must_use]
    pub fn new(key: &str, name: impl Into<String>) -> Self {
        Self {
            id: SubjectId::user(key),
            name: name.into(),
            is_admin: false,
            tokens: None,
        }
    }
}

/// A project: a subject owned by one user and managed by its admins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Project id (`p/<key>`).
    pub id: SubjectId,
    /// Title.
    pub title: String,
    /// Owning user.
    pub owner: SubjectId,
    /// Users with manager rights.
    pub admins: BTreeSet<SubjectId>,
    /// Plain members.
    pub members: BTreeSet<SubjectId>,
}

/// A named set of users that can be granted access collectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group id.
    pub id: GroupId,
    /// Member users.
    pub members: BTreeSet<SubjectId>,
}

/// A storage repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Repository id.
    pub id: RepoId,
    /// Title.
    pub title: String,
    /// Transfer endpoint serving the repository.
    pub endpoint: String,
    /// Root path of the repository, ending in `/`.
    pub path: String,
    /// Repository administrators.
    pub admins: BTreeSet<SubjectId>,
}

impl Repo {
    /// Path holding `subject`'s data inside this repository.
    #[must_use]
    pub fn subject_path(&self, subject: &SubjectId) -> String {
        format!("{}{}", self.path, subject.storage_dir())
    }
}

/// A subject's quota on a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Subject holding the allocation.
    pub subject: SubjectId,
    /// Repository the allocation lives on.
    pub repo: RepoId,
    /// Byte limit.
    pub data_limit: u64,
    /// Record count limit.
    pub rec_limit: u64,
    /// Records currently stored.
    pub rec_count: u64,
    /// Bytes currently stored.
    pub data_size: u64,
    /// Storage path of the allocation.
    pub path: String,
}

impl Allocation {
    /// Creates an empty allocation for `subject` on `repo`.
    #[must_use]
    pub fn new(subject: SubjectId, repo: &Repo, data_limit: u64, rec_limit: u64) -> Self {
        Self {
            path: repo.subject_path(&subject),
            subject,
            repo: repo.id.clone(),
            data_limit,
            rec_limit,
            rec_count: 0,
            data_size: 0,
        }
    }
}

/// A data record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Record id.
    pub id: RecordId,
    /// Title.
    pub title: String,
    /// Alias local to the owner's namespace.
    pub alias: Option<String>,
    /// Owning subject.
    pub owner: SubjectId,
    /// User who created the record.
    pub creator: SubjectId,
    /// Raw data size in bytes.
    pub size: u64,
    /// Where the raw data came from, or lives for external records.
    pub source: Option<String>,
    /// File extension including the leading dot.
    pub ext: Option<String>,
    /// Whether `ext` was derived from the source file name.
    pub ext_auto: bool,
    /// External records point at storage outside the platform.
    pub external: bool,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// A collection of records and sub-collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Collection id.
    pub id: CollectionId,
    /// Title.
    pub title: String,
    /// Owning subject.
    pub owner: SubjectId,
    /// User who created the collection.
    pub creator: SubjectId,
    /// Root collections cannot be deleted.
    pub is_root: bool,
    /// A topic publishes the collection.
    pub topic: Option<String>,
}

impl Collection {
    /// Returns true for published collections.
    #[must_use]
    pub const fn is_public(&self) -> bool {
        self.topic.is_some()
    }
}

/// Where a managed record's raw data is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// The record.
    pub record: RecordId,
    /// Current repository.
    pub repo: RepoId,
    /// Subject whose allocation holds the data.
    pub uid: SubjectId,
    /// Pending destination repository during a move.
    pub new_repo: Option<RepoId>,
    /// Pending owner during an ownership change.
    pub new_owner: Option<SubjectId>,
    /// Pending parent collection during an ownership change.
    pub new_coll: Option<CollectionId>,
}

impl Location {
    /// Creates a settled location.
    #[must_use]
    pub const fn new(record: RecordId, repo: RepoId, uid: SubjectId) -> Self {
        Self {
            record,
            repo,
            uid,
            new_repo: None,
            new_owner: None,
            new_coll: None,
        }
    }

    /// Returns true while a move is pending.
    #[must_use]
    pub const fn is_moving(&self) -> bool {
        self.new_repo.is_some() || self.new_owner.is_some()
    }
}

/// A member of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemRef {
    /// A data record.
    Record(RecordId),
    /// A nested collection.
    Collection(CollectionId),
}

impl ItemRef {
    /// Returns the untyped id of the item.
    #[must_use]
    pub fn resource(&self) -> ResourceId {
        match self {
            Self::Record(id) => id.into(),
            Self::Collection(id) => id.into(),
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(id) => id.fmt(f),
            Self::Collection(id) => id.fmt(f),
        }
    }
}

impl From<RecordId> for ItemRef {
    fn from(id: RecordId) -> Self {
        Self::Record(id)
    }
}

impl From<CollectionId> for ItemRef {
    fn from(id: CollectionId) -> Self {
        Self::Collection(id)
    }
}

/// Who an access control entry applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grantee {
    /// A single user.
    User(SubjectId),
    /// Every member of a group.
    Group(GroupId),
}

/// An access control entry on a record or collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// Grantee.
    pub grantee: Grantee,
    /// Permissions on the item itself.
    pub grant: u32,
    /// Permissions inherited by items inside a collection.
    pub inhgrant: u32,
}
