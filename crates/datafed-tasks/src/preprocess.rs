//! Permission-aware classification of requested records and collections.
//!
//! [`classify`] walks the requested ids depth-first, expanding collections
//! into their members. Permissions are checked per mode; once the grants
//! inherited along the current path cover the mode's requirement, the
//! subtree below is not checked again.
//!
//! The walk threads an accumulator by value through every recursion level
//! and returns it, so sibling branches never share hidden mutable state.
//!
//! In delete mode each record keeps a visit count: explicitly named records
//! get `-1` and are always deleted, records reached only through collections
//! are deleted when every collection link into them is being removed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use datafed_core::{perm, CollectionId, RecordId, SubjectId};

use crate::error::{Error, Result};
use crate::model::{DataRecord, ItemRef, User};
use crate::permissions::PermissionOracle;
use crate::store::Transaction;
use crate::task::TaskType;

/// Visit count of a record named explicitly in a delete request.
pub const EXPLICIT_VISIT: i64 = -1;

/// What the classified items will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Download raw data.
    Get,
    /// Upload raw data.
    Put,
    /// Move records to another repository.
    AllocChange,
    /// Move records to another owner.
    OwnerChange,
    /// Delete records and collections.
    Delete,
}

impl Mode {
    /// Permission bits required on records.
    #[must_use]
    pub const fn data_perm(self) -> u32 {
        match self {
            Self::Get => perm::RD_DATA,
            Self::Put => perm::WR_DATA,
            Self::AllocChange => 0,
            Self::OwnerChange => perm::RD_ALL | perm::DELETE,
            Self::Delete => perm::DELETE,
        }
    }

    /// Permission bits required on collections.
    #[must_use]
    pub const fn coll_perm(self) -> u32 {
        match self {
            Self::Get | Self::AllocChange | Self::OwnerChange => perm::LIST,
            Self::Put => 0,
            Self::Delete => perm::DELETE,
        }
    }

    /// The task type the mode prepares.
    #[must_use]
    pub const fn task_type(self) -> TaskType {
        match self {
            Self::Get => TaskType::DataGet,
            Self::Put => TaskType::DataPut,
            Self::AllocChange => TaskType::RecAllocChange,
            Self::OwnerChange => TaskType::RecOwnerChange,
            Self::Delete => TaskType::RecCollDelete,
        }
    }
}

/// A record selected by the preprocessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    /// Record id.
    pub id: RecordId,
    /// Owner at classification time.
    pub owner: SubjectId,
    /// Raw data size.
    pub size: u64,
    /// Source of the raw data.
    pub source: Option<String>,
    /// File extension.
    pub ext: Option<String>,
}

impl From<&DataRecord> for ClassifiedRecord {
    fn from(rec: &DataRecord) -> Self {
        Self {
            id: rec.id.clone(),
            owner: rec.owner.clone(),
            size: rec.size,
            source: rec.source.clone(),
            ext: rec.ext.clone(),
        }
    }
}

/// Result of [`classify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Every collection visited, in walk order.
    pub collections: Vec<CollectionId>,
    /// Records with platform-managed raw data.
    pub managed: Vec<ClassifiedRecord>,
    /// Records pointing at external storage.
    pub external: Vec<ClassifiedRecord>,
    /// Visit count per record.
    pub visits: BTreeMap<RecordId, i64>,
    /// Whether any item is published through a topic-bearing collection.
    pub has_public: bool,
    /// Owner the records will be moved to, if any.
    pub new_owner: Option<SubjectId>,
}

impl Classification {
    /// Ids of every classified record, external first.
    #[must_use]
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.external
            .iter()
            .chain(&self.managed)
            .map(|r| r.id.clone())
            .collect()
    }
}

/// Accumulated walk state, threaded by value.
#[derive(Default)]
struct Walk {
    out: Classification,
    managed_projects: BTreeSet<SubjectId>,
}

/// Permissions inherited along the current path.
#[derive(Clone, Copy)]
struct Inherited {
    data: u32,
    coll: u32,
}

struct Classifier<'a> {
    tx: &'a dyn Transaction,
    oracle: &'a dyn PermissionOracle,
    client: &'a User,
    mode: Mode,
}

/// Classifies `ids` for `mode` on behalf of `client`.
///
/// # Errors
///
/// Returns `NotFound` for a missing id, `PermissionDenied` when a required
/// permission is missing, and `InvalidParam` for items the mode does not
/// accept (collections or external records in PUT mode).
#[tracing::instrument(skip_all, fields(client = %client.id, mode = ?mode, ids = ids.len()))]
pub fn classify(
    tx: &dyn Transaction,
    oracle: &dyn PermissionOracle,
    client: &User,
    new_owner: Option<&SubjectId>,
    ids: &[ItemRef],
    mode: Mode,
) -> Result<Classification> {
    let classifier = Classifier {
        tx,
        oracle,
        client,
        mode,
    };

    let mut walk = classifier.visit(Walk::default(), ids, None)?;

    if !walk.out.has_public {
        for id in ids {
            if reachable_from_public(tx, id)? {
                walk.out.has_public = true;
                break;
            }
        }
    }

    let mut out = walk.out;
    if mode == Mode::Delete {
        out.managed = deletable(tx, &out.visits, out.managed)?;
        out.external = deletable(tx, &out.visits, out.external)?;
    }
    out.new_owner = new_owner.cloned();

    tracing::debug!(
        collections = out.collections.len(),
        managed = out.managed.len(),
        external = out.external.len(),
        "classified request"
    );
    Ok(out)
}

fn deletable(
    tx: &dyn Transaction,
    visits: &BTreeMap<RecordId, i64>,
    records: Vec<ClassifiedRecord>,
) -> Result<Vec<ClassifiedRecord>> {
    let mut keep = Vec::with_capacity(records.len());
    for rec in records {
        let count = visits.get(&rec.id).copied().unwrap_or_default();
        let links = tx.parents(&ItemRef::Record(rec.id.clone()))?.len();
        if count == EXPLICIT_VISIT || usize::try_from(count).is_ok_and(|c| c == links) {
            keep.push(rec);
        }
    }
    Ok(keep)
}

/// Returns true when `item` is, or sits below, a topic-bearing collection.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn reachable_from_public(tx: &dyn Transaction, item: &ItemRef) -> Result<bool> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![item.clone()];
    while let Some(next) = stack.pop() {
        if let ItemRef::Collection(id) = &next {
            if tx.collection(id)?.is_some_and(|c| c.is_public()) {
                return Ok(true);
            }
        }
        for parent in tx.parents(&next)? {
            if seen.insert(parent.clone()) {
                stack.push(ItemRef::Collection(parent));
            }
        }
    }
    Ok(false)
}

fn denied(what: &str, id: &dyn std::fmt::Display) -> Error {
    Error::PermissionDenied(format!("permission denied for {what} {id}"))
}

impl Classifier<'_> {
    fn visit(&self, mut walk: Walk, ids: &[ItemRef], inherited: Option<Inherited>) -> Result<Walk> {
        for item in ids {
            walk = match item {
                ItemRef::Collection(id) => self.visit_collection(walk, id, inherited)?,
                ItemRef::Record(id) => self.visit_record(walk, id, inherited)?,
            };
        }
        Ok(walk)
    }

    fn visit_collection(
        &self,
        mut walk: Walk,
        id: &CollectionId,
        inherited: Option<Inherited>,
    ) -> Result<Walk> {
        if self.mode == Mode::Put {
            return Err(Error::InvalidParam(
                "collections not supported for PUT operations".into(),
            ));
        }

        let coll = self.tx.require_collection(id)?;
        if coll.is_public() {
            walk.out.has_public = true;
        }
        if coll.is_root && self.mode == Mode::Delete {
            return Err(Error::PermissionDenied(format!(
                "cannot delete root collection {id}"
            )));
        }

        let need_data = self.mode.data_perm();
        let need_coll = self.mode.coll_perm();
        let mut path = inherited.unwrap_or(Inherited { data: 0, coll: 0 });

        if !perm::covers(path.coll, need_coll) || !perm::covers(path.data, need_data) {
            if self
                .oracle
                .is_admin_of_object(self.tx, self.client, &coll.owner, &coll.creator)?
            {
                path = Inherited {
                    data: need_data,
                    coll: need_coll,
                };
            } else {
                let inherit_until = inherited.is_none().then_some(need_data | need_coll);
                let local = self.oracle.local_permissions(
                    self.tx,
                    &self.client.id,
                    &ItemRef::Collection(id.clone()),
                    inherit_until,
                )?;

                // Inheritable grants apply to members only, not the collection itself.
                if !perm::covers(local.grant | local.inherited, need_coll) {
                    return Err(denied("collection", id));
                }
                path.data |= local.inhgrant | local.inherited;
                path.coll |= local.inhgrant | local.inherited;
            }
        }

        walk.out.collections.push(id.clone());
        let children = self.tx.children(id)?;
        self.visit(walk, &children, Some(path))
    }

    fn visit_record(&self, mut walk: Walk, id: &RecordId, inherited: Option<Inherited>) -> Result<Walk> {
        if let Some(count) = walk.out.visits.get_mut(id) {
            if self.mode == Mode::Delete {
                if inherited.is_none() {
                    *count = EXPLICIT_VISIT;
                } else if *count != EXPLICIT_VISIT {
                    *count += 1;
                }
            }
            return Ok(walk);
        }
        let first = if inherited.is_none() { EXPLICIT_VISIT } else { 1 };
        walk.out.visits.insert(id.clone(), first);

        let rec = self.tx.require_record(id)?;
        let path_data = inherited.map_or(0, |p| p.data);

        walk = match self.mode {
            Mode::AllocChange => self.check_alloc_change(walk, &rec)?,
            Mode::OwnerChange => self.check_owner_change(walk, &rec, path_data, inherited)?,
            Mode::Get | Mode::Put | Mode::Delete => {
                self.check_data_access(&rec, path_data, inherited)?;
                walk
            }
        };

        if rec.external {
            if self.mode == Mode::Put {
                return Err(Error::InvalidParam(format!(
                    "cannot upload to external data on record '{id}'"
                )));
            }
            walk.out.external.push(ClassifiedRecord::from(&rec));
        } else if self.mode != Mode::Get || rec.size > 0 {
            walk.out.managed.push(ClassifiedRecord::from(&rec));
        }
        Ok(walk)
    }

    /// Records must be owned by the client or by a project it manages.
    fn check_alloc_change(&self, mut walk: Walk, rec: &DataRecord) -> Result<Walk> {
        if rec.owner == self.client.id || walk.managed_projects.contains(&rec.owner) {
            return Ok(walk);
        }
        if rec.owner.is_project()
            && self
                .oracle
                .is_project_manager(self.tx, self.client, &rec.owner)?
        {
            walk.managed_projects.insert(rec.owner.clone());
            return Ok(walk);
        }
        Err(denied("data record", &rec.id))
    }

    /// Owners, creators, admins and project managers pass; anyone else needs
    /// read and delete permission.
    fn check_owner_change(
        &self,
        mut walk: Walk,
        rec: &DataRecord,
        path_data: u32,
        inherited: Option<Inherited>,
    ) -> Result<Walk> {
        if rec.owner == self.client.id || rec.creator == self.client.id || self.client.is_admin {
            return Ok(walk);
        }

        let mut ok = false;
        if rec.owner.is_project() {
            if walk.managed_projects.contains(&rec.owner) {
                ok = true;
            } else if self
                .oracle
                .is_project_manager(self.tx, self.client, &rec.owner)?
            {
                walk.managed_projects.insert(rec.owner.clone());
                ok = true;
            }
        }

        if !ok {
            self.check_grants(rec, path_data, inherited)?;
        }
        Ok(walk)
    }

    fn check_data_access(
        &self,
        rec: &DataRecord,
        path_data: u32,
        inherited: Option<Inherited>,
    ) -> Result<()> {
        if perm::covers(path_data, self.mode.data_perm()) {
            return Ok(());
        }
        if self
            .oracle
            .is_admin_of_object(self.tx, self.client, &rec.owner, &rec.creator)?
        {
            return Ok(());
        }
        self.check_grants(rec, path_data, inherited)
    }

    fn check_grants(
        &self,
        rec: &DataRecord,
        path_data: u32,
        inherited: Option<Inherited>,
    ) -> Result<()> {
        let need = self.mode.data_perm();
        if perm::covers(path_data, need) {
            return Ok(());
        }
        let inherit_until = inherited.is_none().then_some(need);
        let local = self.oracle.local_permissions(
            self.tx,
            &self.client.id,
            &ItemRef::Record(rec.id.clone()),
            inherit_until,
        )?;
        if perm::covers(local.grant | local.inherited, need) {
            Ok(())
        } else {
            Err(denied("data record", &rec.id))
        }
    }
}
