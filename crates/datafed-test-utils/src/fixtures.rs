//! Pre-built test fixtures for common test scenarios.
//!
//! [`World`] wraps a [`TaskService`] over an [`InMemoryStore`] and seeds the
//! catalog with sensible defaults. Every builder method commits its own
//! transaction.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use datafed_core::{CollectionId, RecordId, RepoId, SubjectId};
use datafed_tasks::config::TaskConfig;
use datafed_tasks::model::{
    Acl, Allocation, Collection, DataRecord, Grantee, ItemRef, Location, Project, Repo, TokenSet,
    User,
};
use datafed_tasks::service::TaskService;
use datafed_tasks::store::memory::InMemoryStore;
use datafed_tasks::store::{ResourceStore, Transaction};

/// One gigabyte.
pub const GB: u64 = 1_000_000_000;

/// Task configuration with millisecond backoff.
pub fn fast_config() -> TaskConfig {
    TaskConfig {
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(4),
        ..TaskConfig::default()
    }
}

/// A task service and the catalog it runs against.
#[derive(Debug, Clone)]
pub struct World {
    service: Arc<TaskService<InMemoryStore>>,
}

impl World {
    /// Creates an empty world with [`fast_config`].
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates an empty world with a custom configuration.
    pub fn with_config(config: TaskConfig) -> Self {
        Self {
            service: Arc::new(TaskService::new(InMemoryStore::new(), config)),
        }
    }

    /// Creates an empty world around a preconfigured service, e.g. one with
    /// a custom permission oracle or state machine registry.
    pub fn with_service(service: TaskService<InMemoryStore>) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    /// The task service.
    pub fn service(&self) -> Arc<TaskService<InMemoryStore>> {
        Arc::clone(&self.service)
    }

    /// The underlying store.
    pub fn store(&self) -> &InMemoryStore {
        self.service.store()
    }

    /// Runs `f` in a committed transaction.
    pub fn write<T>(&self, f: impl FnOnce(&mut dyn Transaction) -> T) -> T {
        let mut tx = self.store().begin().expect("begin");
        let value = f(tx.as_mut());
        tx.commit().expect("commit");
        value
    }

    /// Runs `f` against a read-only snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&dyn Transaction) -> T) -> T {
        let tx = self.store().begin().expect("begin");
        f(tx.as_ref())
    }

    /// Adds a user with linked transfer credentials and a root collection.
    pub fn user(&self, key: &str) -> SubjectId {
        let mut user = User::new(key, key);
        user.tokens = Some(TokenSet {
            access: format!("{key}-access"),
            refresh: format!("{key}-refresh"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        });
        let id = user.id.clone();
        self.write(|tx| tx.put_user(user)).unwrap();
        self.root_for(&id);
        id
    }

    /// Adds a global administrator.
    pub fn admin(&self, key: &str) -> SubjectId {
        let id = self.user(key);
        self.write(|tx| {
            let mut user = tx.require_user(&id)?;
            user.is_admin = true;
            tx.put_user(user)
        })
        .unwrap();
        id
    }

    /// Adds a project with a root collection.
    pub fn project(
        &self,
        key: &str,
        owner: &SubjectId,
        admins: &[&SubjectId],
        members: &[&SubjectId],
    ) -> SubjectId {
        let project = Project {
            id: SubjectId::project(key),
            title: key.to_string(),
            owner: owner.clone(),
            admins: admins.iter().map(|s| (*s).clone()).collect(),
            members: members.iter().map(|s| (*s).clone()).collect(),
        };
        let id = project.id.clone();
        self.write(|tx| tx.put_project(project)).unwrap();
        self.root_for(&id);
        id
    }

    /// Adds a repository administered by `admins`.
    pub fn repo(&self, key: &str, admins: &[&SubjectId]) -> RepoId {
        let repo = Repo {
            id: RepoId::from_key(key),
            title: key.to_string(),
            endpoint: format!("{key}-ep"),
            path: format!("/mnt/{key}/"),
            admins: admins.iter().map(|s| (*s).clone()).collect::<BTreeSet<_>>(),
        };
        let id = repo.id.clone();
        self.write(|tx| tx.put_repo(repo)).unwrap();
        id
    }

    /// Adds an allocation for `subject` on `repo`.
    pub fn allocation(&self, subject: &SubjectId, repo: &RepoId, data_limit: u64, rec_limit: u64) {
        self.write(|tx| {
            let repo = tx.require_repo(repo)?;
            tx.put_allocation(Allocation::new(subject.clone(), &repo, data_limit, rec_limit))
        })
        .unwrap();
    }

    /// Root collection of `subject`.
    pub fn root(&self, subject: &SubjectId) -> CollectionId {
        let kind = if subject.is_project() { "p" } else { "u" };
        CollectionId::from_key(&format!("{kind}_{}_root", subject.key()))
    }

    fn root_for(&self, subject: &SubjectId) {
        let coll = Collection {
            id: self.root(subject),
            title: "Root Collection".into(),
            owner: subject.clone(),
            creator: subject.clone(),
            is_root: true,
            topic: None,
        };
        self.write(|tx| tx.put_collection(coll)).unwrap();
    }

    /// Adds a collection owned by `owner` under `parent`.
    pub fn collection(&self, key: &str, owner: &SubjectId, parent: &CollectionId) -> CollectionId {
        let coll = Collection {
            id: CollectionId::from_key(key),
            title: key.to_string(),
            owner: owner.clone(),
            creator: owner.clone(),
            is_root: false,
            topic: None,
        };
        let id = coll.id.clone();
        self.write(|tx| {
            tx.put_collection(coll)?;
            tx.link(parent, ItemRef::Collection(id.clone()))
        })
        .unwrap();
        id
    }

    /// Publishes a collection under `topic`.
    pub fn publish(&self, coll: &CollectionId, topic: &str) {
        self.write(|tx| {
            let mut c = tx.require_collection(coll)?;
            c.topic = Some(topic.to_string());
            tx.put_collection(c)
        })
        .unwrap();
    }

    /// Adds a managed record of `size` bytes stored on `repo` and counts it
    /// against the owner's allocation.
    pub fn record(
        &self,
        key: &str,
        owner: &SubjectId,
        size: u64,
        repo: &RepoId,
        parent: &CollectionId,
    ) -> RecordId {
        let rec = data_record(key, owner, size, false);
        let id = rec.id.clone();
        self.write(|tx| {
            let mut alloc = tx
                .allocation(owner, repo)?
                .expect("record fixture needs an allocation");
            alloc.rec_count += 1;
            alloc.data_size += size;
            tx.put_allocation(alloc)?;
            tx.put_record(rec)?;
            tx.put_location(Location::new(id.clone(), repo.clone(), owner.clone()))?;
            tx.link(parent, ItemRef::Record(id.clone()))
        })
        .unwrap();
        id
    }

    /// Adds a record whose data lives at an external `source`.
    pub fn external_record(
        &self,
        key: &str,
        owner: &SubjectId,
        source: &str,
        parent: &CollectionId,
    ) -> RecordId {
        let mut rec = data_record(key, owner, 0, true);
        rec.source = Some(source.to_string());
        let id = rec.id.clone();
        self.write(|tx| {
            tx.put_record(rec)?;
            tx.link(parent, ItemRef::Record(id.clone()))
        })
        .unwrap();
        id
    }

    /// Sets the alias of a record.
    pub fn alias(&self, record: &RecordId, alias: &str) {
        self.write(|tx| {
            let mut rec = tx.require_record(record)?;
            let prefix = rec.owner.alias_prefix();
            tx.put_alias(&format!("{prefix}{alias}"), record)?;
            rec.alias = Some(alias.to_string());
            tx.put_record(rec)
        })
        .unwrap();
    }

    /// Links an existing item under another collection.
    pub fn link(&self, parent: &CollectionId, item: impl Into<ItemRef>) {
        let item = item.into();
        self.write(|tx| tx.link(parent, item)).unwrap();
    }

    /// Grants `grant` (and `inhgrant` to members) on `item` to `user`.
    pub fn grant(&self, item: impl Into<ItemRef>, user: &SubjectId, grant: u32, inhgrant: u32) {
        let item = item.into();
        let acl = Acl {
            grantee: Grantee::User(user.clone()),
            grant,
            inhgrant,
        };
        self.write(|tx| tx.put_acl(&item, acl)).unwrap();
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

fn data_record(key: &str, owner: &SubjectId, size: u64, external: bool) -> DataRecord {
    DataRecord {
        id: RecordId::from_key(key),
        title: key.to_string(),
        alias: None,
        owner: owner.clone(),
        creator: owner.clone(),
        size,
        source: None,
        ext: None,
        ext_auto: true,
        external,
        updated_at: Utc::now(),
    }
}

/// Record ids as request items.
pub fn items(ids: &[&RecordId]) -> Vec<ItemRef> {
    ids.iter().map(|id| ItemRef::Record((*id).clone())).collect()
}
