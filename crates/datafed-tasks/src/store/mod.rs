//! Pluggable storage for the resource graph and task state.
//!
//! [`ResourceStore`] hands out [`Transaction`]s. Every task operation runs
//! inside exactly one transaction, so a task's status, its lock and block
//! edges and the catalog mutations of a step either all commit or none do.
//!
//! ## Design Principles
//!
//! - **Optimistic concurrency**: commit fails with a transient
//!   [`Error::WriteConflict`] when another transaction committed first; callers
//!   retry through [`crate::retry::transact`]
//! - **Explicit queries**: graph traversal is expressed as narrow methods
//!   (`parents`, `children`, `locks_on`, …) so any transactional backend can
//!   implement them
//! - **Testability**: [`memory::InMemoryStore`] backs tests and development

pub mod memory;

use datafed_core::{CollectionId, GroupId, RecordId, RepoId, ResourceId, SubjectId, TaskId};

use crate::admission::{BlockEdge, LockEdge};
use crate::error::{Error, Result};
use crate::model::{
    Acl, Allocation, Collection, DataRecord, Group, ItemRef, Location, Project, Repo, User,
};
use crate::task::Task;

/// A unit of atomic work against the resource graph.
///
/// Dropping a transaction without calling [`Transaction::commit`] discards
/// every change made through it.
pub trait Transaction: Send {
    // --- Subjects ---

    /// Gets a user.
    fn user(&self, id: &SubjectId) -> Result<Option<User>>;
    /// Inserts or replaces a user.
    fn put_user(&mut self, user: User) -> Result<()>;
    /// Gets a project.
    fn project(&self, id: &SubjectId) -> Result<Option<Project>>;
    /// Inserts or replaces a project.
    fn put_project(&mut self, project: Project) -> Result<()>;
    /// Removes a project document.
    fn remove_project(&mut self, id: &SubjectId) -> Result<()>;
    /// Gets a group.
    fn group(&self, id: &GroupId) -> Result<Option<Group>>;
    /// Inserts or replaces a group.
    fn put_group(&mut self, group: Group) -> Result<()>;

    // --- Repositories and allocations ---

    /// Gets a repository.
    fn repo(&self, id: &RepoId) -> Result<Option<Repo>>;
    /// Inserts or replaces a repository.
    fn put_repo(&mut self, repo: Repo) -> Result<()>;
    /// Gets the allocation of `subject` on `repo`.
    fn allocation(&self, subject: &SubjectId, repo: &RepoId) -> Result<Option<Allocation>>;
    /// Lists every allocation held by `subject`.
    fn allocations_of(&self, subject: &SubjectId) -> Result<Vec<Allocation>>;
    /// Inserts or replaces an allocation.
    fn put_allocation(&mut self, allocation: Allocation) -> Result<()>;
    /// Removes an allocation if present.
    fn remove_allocation(&mut self, subject: &SubjectId, repo: &RepoId) -> Result<()>;

    // --- Records and collections ---

    /// Gets a data record.
    fn record(&self, id: &RecordId) -> Result<Option<DataRecord>>;
    /// Inserts or replaces a data record.
    fn put_record(&mut self, record: DataRecord) -> Result<()>;
    /// Removes a record with its location, ACLs, alias and item edges.
    fn remove_record(&mut self, id: &RecordId) -> Result<()>;
    /// Gets a collection.
    fn collection(&self, id: &CollectionId) -> Result<Option<Collection>>;
    /// Inserts or replaces a collection.
    fn put_collection(&mut self, collection: Collection) -> Result<()>;
    /// Removes a collection with its ACLs and item edges.
    fn remove_collection(&mut self, id: &CollectionId) -> Result<()>;
    /// Lists records owned by `owner`.
    fn owned_records(&self, owner: &SubjectId) -> Result<Vec<RecordId>>;
    /// Lists collections owned by `owner`.
    fn owned_collections(&self, owner: &SubjectId) -> Result<Vec<CollectionId>>;

    // --- Locations ---

    /// Gets the storage location of a managed record.
    fn location(&self, record: &RecordId) -> Result<Option<Location>>;
    /// Inserts or replaces a location.
    fn put_location(&mut self, location: Location) -> Result<()>;
    /// Lists records stored in `subject`'s allocation on `repo`.
    fn records_at(&self, subject: &SubjectId, repo: &RepoId) -> Result<Vec<RecordId>>;

    // --- Item edges ---

    /// Lists the direct members of a collection.
    fn children(&self, collection: &CollectionId) -> Result<Vec<ItemRef>>;
    /// Lists the collections directly containing `item`.
    fn parents(&self, item: &ItemRef) -> Result<Vec<CollectionId>>;
    /// Adds `child` to `parent`.
    fn link(&mut self, parent: &CollectionId, child: ItemRef) -> Result<()>;
    /// Removes `child` from `parent`.
    fn unlink(&mut self, parent: &CollectionId, child: &ItemRef) -> Result<()>;

    // --- Access control ---

    /// Lists the ACL entries of an item.
    fn acls(&self, item: &ItemRef) -> Result<Vec<Acl>>;
    /// Adds an ACL entry.
    fn put_acl(&mut self, item: &ItemRef, acl: Acl) -> Result<()>;
    /// Removes every ACL entry of an item.
    fn clear_acls(&mut self, item: &ItemRef) -> Result<()>;

    // --- Aliases ---

    /// Resolves a fully scoped alias (`u:alice:name`).
    fn alias_target(&self, alias: &str) -> Result<Option<RecordId>>;
    /// Binds a fully scoped alias to a record.
    fn put_alias(&mut self, alias: &str, target: &RecordId) -> Result<()>;
    /// Removes a fully scoped alias.
    fn remove_alias(&mut self, alias: &str) -> Result<()>;

    // --- Tasks ---

    /// Gets a task.
    fn task(&self, id: &TaskId) -> Result<Option<Task>>;
    /// Lists every task.
    fn tasks(&self) -> Result<Vec<Task>>;
    /// Inserts or replaces a task.
    fn put_task(&mut self, task: Task) -> Result<()>;
    /// Removes a task document.
    fn remove_task(&mut self, id: &TaskId) -> Result<()>;

    // --- Admission control edges ---

    /// Lists locks on a resource in registration order.
    fn locks_on(&self, resource: &ResourceId) -> Result<Vec<LockEdge>>;
    /// Lists locks held by a task.
    fn locks_held_by(&self, task: &TaskId) -> Result<Vec<LockEdge>>;
    /// Appends a lock edge.
    fn put_lock(&mut self, lock: LockEdge) -> Result<()>;
    /// Removes every lock held by a task.
    fn remove_locks_held_by(&mut self, task: &TaskId) -> Result<()>;
    /// Lists tasks that `task` is waiting on.
    fn blockers_of(&self, task: &TaskId) -> Result<Vec<TaskId>>;
    /// Lists tasks waiting on `task`.
    fn waiting_on(&self, task: &TaskId) -> Result<Vec<TaskId>>;
    /// Adds a block edge.
    fn put_block(&mut self, edge: BlockEdge) -> Result<()>;
    /// Removes a block edge.
    fn remove_block(&mut self, edge: &BlockEdge) -> Result<()>;

    /// Commits every change made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteConflict`] when a concurrent transaction
    /// committed first.
    fn commit(self: Box<Self>) -> Result<()>;

    // --- Lookups that fail when the resource is missing ---

    /// Gets a user or fails with `NotFound`.
    fn require_user(&self, id: &SubjectId) -> Result<User> {
        self.user(id)?.ok_or_else(|| Error::not_found("user", id))
    }

    /// Gets a project or fails with `NotFound`.
    fn require_project(&self, id: &SubjectId) -> Result<Project> {
        self.project(id)?.ok_or_else(|| Error::not_found("project", id))
    }

    /// Gets a repository or fails with `NotFound`.
    fn require_repo(&self, id: &RepoId) -> Result<Repo> {
        self.repo(id)?.ok_or_else(|| Error::not_found("repository", id))
    }

    /// Gets a record or fails with `NotFound`.
    fn require_record(&self, id: &RecordId) -> Result<DataRecord> {
        self.record(id)?.ok_or_else(|| Error::not_found("record", id))
    }

    /// Gets a collection or fails with `NotFound`.
    fn require_collection(&self, id: &CollectionId) -> Result<Collection> {
        self.collection(id)?
            .ok_or_else(|| Error::not_found("collection", id))
    }

    /// Gets a task or fails with `NotFound`.
    fn require_task(&self, id: &TaskId) -> Result<Task> {
        self.task(id)?.ok_or_else(|| Error::not_found("task", id))
    }

    /// Returns true when `subject` names an existing user or project.
    fn subject_exists(&self, subject: &SubjectId) -> Result<bool> {
        if subject.is_project() {
            Ok(self.project(subject)?.is_some())
        } else {
            Ok(self.user(subject)?.is_some())
        }
    }
}

/// A source of transactions over the resource graph.
pub trait ResourceStore: Send + Sync {
    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the backend is unavailable.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>>;
}
