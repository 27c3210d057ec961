//! Two-phase record moves between allocations and owners.
//!
//! [`move_init`] marks each record's location with its pending destination,
//! [`move_fini`] applies the move once the raw data has been transferred,
//! and [`move_revert`] clears the pending markers when the transfer failed.
//! [`move_external`] re-owns records whose data lives outside the platform.

use chrono::Utc;

use datafed_core::{CollectionId, RecordId, RepoId, SubjectId};

use crate::error::{Error, Result};
use crate::model::{DataRecord, ItemRef, Location};
use crate::store::Transaction;

/// Destination owner and collection of an ownership change.
#[derive(Debug, Clone, Copy)]
pub struct NewOwner<'a> {
    /// Subject receiving the records.
    pub owner: &'a SubjectId,
    /// Collection the records are linked into.
    pub collection: &'a CollectionId,
}

fn location_of(tx: &dyn Transaction, id: &RecordId) -> Result<Location> {
    tx.location(id)?
        .ok_or_else(|| Error::InternalFault(format!("record '{id}' has no storage location")))
}

/// Marks records with their pending destination.
///
/// Records already at the destination are skipped, so re-running the step
/// is harmless.
///
/// # Errors
///
/// Returns `InternalFault` when a record has no location.
pub fn move_init(
    tx: &mut dyn Transaction,
    records: &[RecordId],
    new_repo: &RepoId,
    new_owner: Option<NewOwner<'_>>,
) -> Result<()> {
    for id in records {
        let mut loc = location_of(tx, id)?;
        match new_owner {
            None if &loc.repo == new_repo => continue,
            Some(dst) if &loc.uid == dst.owner => continue,
            _ => {}
        }

        loc.new_repo = Some(new_repo.clone());
        if let Some(dst) = new_owner {
            loc.new_owner = Some(dst.owner.clone());
            loc.new_coll = Some(dst.collection.clone());
        }
        tx.put_location(loc)?;
    }
    Ok(())
}

/// Clears pending destinations without touching ownership.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn move_revert(tx: &mut dyn Transaction, records: &[RecordId]) -> Result<()> {
    for id in records {
        let Some(mut loc) = tx.location(id)? else {
            continue;
        };
        if !loc.is_moving() {
            continue;
        }
        loc.new_repo = None;
        loc.new_owner = None;
        loc.new_coll = None;
        tx.put_location(loc)?;
    }
    Ok(())
}

/// Applies pending moves: re-owns records with a pending owner, shifts
/// allocation counters from the source to the destination allocation, and
/// replaces the location.
///
/// # Errors
///
/// Returns `InternalFault` when the bookkeeping is inconsistent: a missing
/// allocation on either side, or a destination collection that is missing or
/// owned by someone else.
pub fn move_fini(tx: &mut dyn Transaction, records: &[RecordId]) -> Result<()> {
    for id in records {
        let loc = location_of(tx, id)?;
        let Some(new_repo) = loc.new_repo.clone() else {
            continue;
        };
        let mut rec = tx.require_record(id)?;

        if let Some(new_owner) = &loc.new_owner {
            let coll_id = loc.new_coll.as_ref().ok_or_else(|| {
                Error::InternalFault(format!("record '{id}' missing destination collection"))
            })?;
            ensure_destination(tx, coll_id, new_owner)?;
            reown(tx, &mut rec, new_owner, coll_id)?;
        }

        let mut src = tx.allocation(&loc.uid, &loc.repo)?.ok_or_else(|| {
            Error::InternalFault(format!(
                "record '{id}' has mismatched allocation/location (cur)"
            ))
        })?;
        src.rec_count = src.rec_count.saturating_sub(1);
        src.data_size = src.data_size.saturating_sub(rec.size);
        tx.put_allocation(src)?;

        let new_uid = loc.new_owner.clone().unwrap_or_else(|| loc.uid.clone());
        let mut dst = tx.allocation(&new_uid, &new_repo)?.ok_or_else(|| {
            Error::InternalFault(format!(
                "record '{id}' has mismatched allocation/location (new)"
            ))
        })?;
        dst.rec_count += 1;
        dst.data_size += rec.size;
        tx.put_allocation(dst)?;

        tx.put_location(Location::new(id.clone(), new_repo, new_uid))?;
        tx.put_record(rec)?;
    }
    Ok(())
}

/// Re-owns records without managed storage and links them into `collection`.
///
/// # Errors
///
/// Returns `InternalFault` when the destination collection is missing or not
/// owned by `owner`.
pub fn move_external(
    tx: &mut dyn Transaction,
    records: &[RecordId],
    owner: &SubjectId,
    collection: &CollectionId,
) -> Result<()> {
    ensure_destination(tx, collection, owner)?;
    for id in records {
        let mut rec = tx.require_record(id)?;
        if &rec.owner == owner {
            continue;
        }
        reown(tx, &mut rec, owner, collection)?;
        tx.put_record(rec)?;
    }
    Ok(())
}

fn ensure_destination(tx: &dyn Transaction, coll: &CollectionId, owner: &SubjectId) -> Result<()> {
    let Some(dst) = tx.collection(coll)? else {
        return Err(Error::InternalFault(format!(
            "destination collection '{coll}' does not exist"
        )));
    };
    if &dst.owner != owner {
        return Err(Error::InternalFault(format!(
            "destination collection '{coll}' not owned by {owner}"
        )));
    }
    Ok(())
}

/// Clears ACLs, re-parents the record, moves its alias into the new owner's
/// namespace and updates the owner field. The caller persists `rec`.
fn reown(
    tx: &mut dyn Transaction,
    rec: &mut DataRecord,
    owner: &SubjectId,
    collection: &CollectionId,
) -> Result<()> {
    let item = ItemRef::Record(rec.id.clone());
    tx.clear_acls(&item)?;
    for parent in tx.parents(&item)? {
        tx.unlink(&parent, &item)?;
    }
    tx.link(collection, item)?;

    if let Some(local) = rec.alias.clone() {
        tx.remove_alias(&format!("{}{local}", rec.owner.alias_prefix()))?;
        let prefix = owner.alias_prefix();
        let mut suffix = 0_u32;
        loop {
            let candidate = if suffix == 0 {
                local.clone()
            } else {
                format!("{local}-{suffix}")
            };
            let key = format!("{prefix}{candidate}");
            if tx.alias_target(&key)?.is_none() {
                tx.put_alias(&key, &rec.id)?;
                rec.alias = Some(candidate);
                break;
            }
            suffix += 1;
        }
    }

    rec.owner = owner.clone();
    rec.updated_at = Utc::now();
    Ok(())
}
