//! In-memory resource store for testing.
//!
//! [`InMemoryStore`] keeps the whole graph behind a `RwLock` and stamps it
//! with a version. Each transaction works on a private copy and its commit
//! fails with a write conflict if the version moved in the meantime.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Whole-graph copies**: Every transaction clones the graph

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use datafed_core::{CollectionId, GroupId, RecordId, RepoId, ResourceId, SubjectId, TaskId};

use super::{ResourceStore, Transaction};
use crate::admission::{BlockEdge, LockEdge};
use crate::error::{Error, Result};
use crate::model::{
    Acl, Allocation, Collection, DataRecord, Group, ItemRef, Location, Project, Repo, User,
};
use crate::task::Task;

#[derive(Debug, Clone, Default)]
struct Graph {
    users: HashMap<SubjectId, User>,
    projects: HashMap<SubjectId, Project>,
    groups: HashMap<GroupId, Group>,
    repos: HashMap<RepoId, Repo>,
    allocations: BTreeMap<(SubjectId, RepoId), Allocation>,
    records: BTreeMap<RecordId, DataRecord>,
    collections: BTreeMap<CollectionId, Collection>,
    locations: BTreeMap<RecordId, Location>,
    items: Vec<(CollectionId, ItemRef)>,
    acls: HashMap<ItemRef, Vec<Acl>>,
    aliases: HashMap<String, RecordId>,
    tasks: BTreeMap<TaskId, Task>,
    locks: Vec<LockEdge>,
    blocks: Vec<BlockEdge>,
}

#[derive(Debug, Default)]
struct State {
    version: u64,
    graph: Graph,
    injected_conflicts: u32,
}

/// In-memory store for testing.
///
/// ## Example
///
/// ```rust
/// use datafed_tasks::store::memory::InMemoryStore;
/// use datafed_tasks::store::ResourceStore;
///
/// let store = InMemoryStore::new();
/// let tx = store.begin().unwrap();
/// tx.commit().unwrap();
/// assert_eq!(store.version().unwrap(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of committed transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn version(&self) -> Result<u64> {
        Ok(self.state.read().map_err(poison_err)?.version)
    }

    /// Makes the next `count` commits fail with a write conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn inject_conflicts(&self, count: u32) -> Result<()> {
        self.state.write().map_err(poison_err)?.injected_conflicts = count;
        Ok(())
    }
}

impl ResourceStore for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(Box::new(MemoryTransaction {
            store: self,
            base_version: state.version,
            graph: state.graph.clone(),
        }))
    }
}

/// A transaction over an [`InMemoryStore`] snapshot.
#[derive(Debug)]
pub struct MemoryTransaction<'a> {
    store: &'a InMemoryStore,
    base_version: u64,
    graph: Graph,
}

impl Transaction for MemoryTransaction<'_> {
    fn user(&self, id: &SubjectId) -> Result<Option<User>> {
        Ok(self.graph.users.get(id).cloned())
    }

    fn put_user(&mut self, user: User) -> Result<()> {
        self.graph.users.insert(user.id.clone(), user);
        Ok(())
    }

    fn project(&self, id: &SubjectId) -> Result<Option<Project>> {
        Ok(self.graph.projects.get(id).cloned())
    }

    fn put_project(&mut self, project: Project) -> Result<()> {
        self.graph.projects.insert(project.id.clone(), project);
        Ok(())
    }

    fn remove_project(&mut self, id: &SubjectId) -> Result<()> {
        self.graph.projects.remove(id);
        Ok(())
    }

    fn group(&self, id: &GroupId) -> Result<Option<Group>> {
        Ok(self.graph.groups.get(id).cloned())
    }

    fn put_group(&mut self, group: Group) -> Result<()> {
        self.graph.groups.insert(group.id.clone(), group);
        Ok(())
    }

    fn repo(&self, id: &RepoId) -> Result<Option<Repo>> {
        Ok(self.graph.repos.get(id).cloned())
    }

    fn put_repo(&mut self, repo: Repo) -> Result<()> {
        self.graph.repos.insert(repo.id.clone(), repo);
        Ok(())
    }

    fn allocation(&self, subject: &SubjectId, repo: &RepoId) -> Result<Option<Allocation>> {
        Ok(self
            .graph
            .allocations
            .get(&(subject.clone(), repo.clone()))
            .cloned())
    }

    fn allocations_of(&self, subject: &SubjectId) -> Result<Vec<Allocation>> {
        Ok(self
            .graph
            .allocations
            .values()
            .filter(|a| &a.subject == subject)
            .cloned()
            .collect())
    }

    fn put_allocation(&mut self, allocation: Allocation) -> Result<()> {
        let key = (allocation.subject.clone(), allocation.repo.clone());
        self.graph.allocations.insert(key, allocation);
        Ok(())
    }

    fn remove_allocation(&mut self, subject: &SubjectId, repo: &RepoId) -> Result<()> {
        self.graph
            .allocations
            .remove(&(subject.clone(), repo.clone()));
        Ok(())
    }

    fn record(&self, id: &RecordId) -> Result<Option<DataRecord>> {
        Ok(self.graph.records.get(id).cloned())
    }

    fn put_record(&mut self, record: DataRecord) -> Result<()> {
        self.graph.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn remove_record(&mut self, id: &RecordId) -> Result<()> {
        let item = ItemRef::Record(id.clone());
        self.graph.records.remove(id);
        self.graph.locations.remove(id);
        self.graph.items.retain(|(_, child)| child != &item);
        self.graph.acls.remove(&item);
        self.graph.aliases.retain(|_, target| target != id);
        Ok(())
    }

    fn collection(&self, id: &CollectionId) -> Result<Option<Collection>> {
        Ok(self.graph.collections.get(id).cloned())
    }

    fn put_collection(&mut self, collection: Collection) -> Result<()> {
        self.graph
            .collections
            .insert(collection.id.clone(), collection);
        Ok(())
    }

    fn remove_collection(&mut self, id: &CollectionId) -> Result<()> {
        let item = ItemRef::Collection(id.clone());
        self.graph.collections.remove(id);
        self.graph
            .items
            .retain(|(parent, child)| parent != id && child != &item);
        self.graph.acls.remove(&item);
        Ok(())
    }

    fn owned_records(&self, owner: &SubjectId) -> Result<Vec<RecordId>> {
        Ok(self
            .graph
            .records
            .values()
            .filter(|r| &r.owner == owner)
            .map(|r| r.id.clone())
            .collect())
    }

    fn owned_collections(&self, owner: &SubjectId) -> Result<Vec<CollectionId>> {
        Ok(self
            .graph
            .collections
            .values()
            .filter(|c| &c.owner == owner)
            .map(|c| c.id.clone())
            .collect())
    }

    fn location(&self, record: &RecordId) -> Result<Option<Location>> {
        Ok(self.graph.locations.get(record).cloned())
    }

    fn put_location(&mut self, location: Location) -> Result<()> {
        self.graph
            .locations
            .insert(location.record.clone(), location);
        Ok(())
    }

    fn records_at(&self, subject: &SubjectId, repo: &RepoId) -> Result<Vec<RecordId>> {
        Ok(self
            .graph
            .locations
            .values()
            .filter(|loc| &loc.uid == subject && &loc.repo == repo)
            .map(|loc| loc.record.clone())
            .collect())
    }

    fn children(&self, collection: &CollectionId) -> Result<Vec<ItemRef>> {
        Ok(self
            .graph
            .items
            .iter()
            .filter(|(parent, _)| parent == collection)
            .map(|(_, child)| child.clone())
            .collect())
    }

    fn parents(&self, item: &ItemRef) -> Result<Vec<CollectionId>> {
        Ok(self
            .graph
            .items
            .iter()
            .filter(|(_, child)| child == item)
            .map(|(parent, _)| parent.clone())
            .collect())
    }

    fn link(&mut self, parent: &CollectionId, child: ItemRef) -> Result<()> {
        let exists = self
            .graph
            .items
            .iter()
            .any(|(p, c)| p == parent && c == &child);
        if !exists {
            self.graph.items.push((parent.clone(), child));
        }
        Ok(())
    }

    fn unlink(&mut self, parent: &CollectionId, child: &ItemRef) -> Result<()> {
        self.graph
            .items
            .retain(|(p, c)| !(p == parent && c == child));
        Ok(())
    }

    fn acls(&self, item: &ItemRef) -> Result<Vec<Acl>> {
        Ok(self.graph.acls.get(item).cloned().unwrap_or_default())
    }

    fn put_acl(&mut self, item: &ItemRef, acl: Acl) -> Result<()> {
        self.graph.acls.entry(item.clone()).or_default().push(acl);
        Ok(())
    }

    fn clear_acls(&mut self, item: &ItemRef) -> Result<()> {
        self.graph.acls.remove(item);
        Ok(())
    }

    fn alias_target(&self, alias: &str) -> Result<Option<RecordId>> {
        Ok(self.graph.aliases.get(alias).cloned())
    }

    fn put_alias(&mut self, alias: &str, target: &RecordId) -> Result<()> {
        if let Some(existing) = self.graph.aliases.get(alias) {
            if existing != target {
                return Err(Error::InvalidParam(format!(
                    "alias '{alias}' already in use by {existing}"
                )));
            }
        }
        self.graph
            .aliases
            .insert(alias.to_string(), target.clone());
        Ok(())
    }

    fn remove_alias(&mut self, alias: &str) -> Result<()> {
        self.graph.aliases.remove(alias);
        Ok(())
    }

    fn task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.graph.tasks.get(id).cloned())
    }

    fn tasks(&self) -> Result<Vec<Task>> {
        Ok(self.graph.tasks.values().cloned().collect())
    }

    fn put_task(&mut self, task: Task) -> Result<()> {
        self.graph.tasks.insert(task.id, task);
        Ok(())
    }

    fn remove_task(&mut self, id: &TaskId) -> Result<()> {
        self.graph.tasks.remove(id);
        Ok(())
    }

    fn locks_on(&self, resource: &ResourceId) -> Result<Vec<LockEdge>> {
        Ok(self
            .graph
            .locks
            .iter()
            .filter(|lock| &lock.resource == resource)
            .cloned()
            .collect())
    }

    fn locks_held_by(&self, task: &TaskId) -> Result<Vec<LockEdge>> {
        Ok(self
            .graph
            .locks
            .iter()
            .filter(|lock| &lock.task == task)
            .cloned()
            .collect())
    }

    fn put_lock(&mut self, lock: LockEdge) -> Result<()> {
        self.graph.locks.push(lock);
        Ok(())
    }

    fn remove_locks_held_by(&mut self, task: &TaskId) -> Result<()> {
        self.graph.locks.retain(|lock| &lock.task != task);
        Ok(())
    }

    fn blockers_of(&self, task: &TaskId) -> Result<Vec<TaskId>> {
        Ok(self
            .graph
            .blocks
            .iter()
            .filter(|edge| &edge.blocked == task)
            .map(|edge| edge.blocker)
            .collect())
    }

    fn waiting_on(&self, task: &TaskId) -> Result<Vec<TaskId>> {
        Ok(self
            .graph
            .blocks
            .iter()
            .filter(|edge| &edge.blocker == task)
            .map(|edge| edge.blocked)
            .collect())
    }

    fn put_block(&mut self, edge: BlockEdge) -> Result<()> {
        if !self.graph.blocks.contains(&edge) {
            self.graph.blocks.push(edge);
        }
        Ok(())
    }

    fn remove_block(&mut self, edge: &BlockEdge) -> Result<()> {
        self.graph.blocks.retain(|e| e != edge);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.store.state.write().map_err(poison_err)?;
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Err(Error::write_conflict("injected commit conflict"));
        }
        if state.version != this.base_version {
            return Err(Error::write_conflict(format!(
                "graph moved from version {} to {}",
                this.base_version, state.version
            )));
        }
        state.graph = this.graph;
        state.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;

    #[test]
    fn uncommitted_changes_are_discarded() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.put_user(User::new("alice", "Alice")).unwrap();
        }

        let tx = store.begin().unwrap();
        assert!(tx.user(&SubjectId::user("alice")).unwrap().is_none());
        assert_eq!(store.version().unwrap(), 0);
    }

    #[test]
    fn concurrent_commit_is_a_write_conflict() {
        let store = InMemoryStore::new();
        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();

        first.put_user(User::new("alice", "Alice")).unwrap();
        second.put_user(User::new("bob", "Bob")).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(err.is_transient());

        let tx = store.begin().unwrap();
        assert!(tx.user(&SubjectId::user("alice")).unwrap().is_some());
        assert!(tx.user(&SubjectId::user("bob")).unwrap().is_none());
    }

    #[test]
    fn injected_conflicts_fail_the_next_commits() {
        let store = InMemoryStore::new();
        store.inject_conflicts(2).unwrap();

        assert!(store.begin().unwrap().commit().is_err());
        assert!(store.begin().unwrap().commit().is_err());
        assert!(store.begin().unwrap().commit().is_ok());
    }

    #[test]
    fn item_edges_answer_parents_and_children() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().unwrap();
        let root = CollectionId::from_key("root");
        let rec = ItemRef::Record(RecordId::from_key("1"));

        tx.link(&root, rec.clone()).unwrap();
        tx.link(&root, rec.clone()).unwrap();

        assert_eq!(tx.children(&root).unwrap(), vec![rec.clone()]);
        assert_eq!(tx.parents(&rec).unwrap(), vec![root.clone()]);

        tx.unlink(&root, &rec).unwrap();
        assert!(tx.parents(&rec).unwrap().is_empty());
    }
}
