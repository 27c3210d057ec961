//! Chunked record moves shared by allocation and ownership changes.
//!
//! Each planned chunk takes four steps:
//!
//! | Sub-step | Effect |
//! |----------|--------|
//! | 0 | check destination capacity, mark records with their pending move |
//! | 1 | RAW_DATA_TRANSFER to the destination allocation |
//! | 2 | apply the move to records and allocation counters |
//! | 3 | RAW_DATA_DELETE at the source |
//!
//! A failure during sub-steps 1 or 2 reverts the chunk's pending markers.

use super::{planned, transfer_command, StepOutcome};
use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::metrics::TaskMetrics;
use crate::record_move::{self, NewOwner};
use crate::store::Transaction;
use crate::task::{Command, Encryption, MovePayload, Task};
use crate::transfer::{self, RepoFiles};

/// Steps per chunk.
pub(super) const STEPS_PER_CHUNK: i64 = 4;

/// Plans the transfer chunks of `state`. Records already at their
/// destination are left out.
pub(super) fn plan(
    tx: &dyn Transaction,
    config: &TaskConfig,
    metrics: &TaskMetrics,
    task: &Task,
    state: &MovePayload,
    owner_change: bool,
) -> Result<Vec<transfer::TransferDescriptor>> {
    let dst_repo = tx.require_repo(&state.dst_repo)?;

    let mut pending = Vec::with_capacity(state.glob_data.len());
    for rec in &state.glob_data {
        let Some(loc) = tx.location(&rec.id)? else {
            return Err(Error::InternalFault(format!(
                "record '{}' has no storage location",
                rec.id
            )));
        };
        let settled = if owner_change {
            loc.uid == state.owner
        } else {
            loc.repo == state.dst_repo
        };
        if !settled {
            pending.push(rec.clone());
        }
    }

    let xfr = transfer::plan_move(tx, &pending, &dst_repo, &state.owner, config.max_xfr_size)?;
    metrics.observe_transfer_chunks(task.task_type.as_label(), xfr.len());
    tracing::debug!(
        task_id = %task.id,
        records = pending.len(),
        chunks = xfr.len(),
        "planned record move"
    );
    Ok(xfr)
}

fn new_owner(state: &MovePayload, owner_change: bool) -> Result<Option<NewOwner<'_>>> {
    if !owner_change {
        return Ok(None);
    }
    let collection = state.dst_coll.as_ref().ok_or_else(|| {
        Error::InternalFault("ownership change without destination collection".into())
    })?;
    Ok(Some(NewOwner {
        owner: &state.owner,
        collection,
    }))
}

/// Executes sub-step `sub` of chunk `chunk`.
pub(super) fn step(
    tx: &mut dyn Transaction,
    task: &Task,
    state: &MovePayload,
    chunk: i64,
    sub: i64,
    owner_change: bool,
) -> Result<StepOutcome> {
    let descriptor = planned(task, &state.xfr, chunk)?;
    let ids = descriptor.record_ids();

    match sub {
        0 => {
            check_capacity(tx, state, &descriptor)?;
            record_move::move_init(tx, &ids, &state.dst_repo, new_owner(state, owner_change)?)?;
            Ok(StepOutcome::Advance)
        }
        1 => Ok(StepOutcome::Command(transfer_command(
            tx,
            task,
            Encryption::None,
            descriptor,
        )?)),
        2 => {
            record_move::move_fini(tx, &ids)?;
            Ok(StepOutcome::Advance)
        }
        _ => {
            let repo_id = descriptor.src_repo.ok_or_else(|| {
                Error::InternalFault("moved chunk has no source repository".into())
            })?;
            Ok(StepOutcome::Command(Command::RawDataDelete(RepoFiles {
                repo_id,
                repo_path: descriptor.src_path,
                ids,
            })))
        }
    }
}

/// Reverts pending markers when `sub` is a transfer or apply step.
pub(super) fn rollback(
    tx: &mut dyn Transaction,
    task: &Task,
    state: &MovePayload,
    chunk: i64,
    sub: i64,
) -> Result<()> {
    if sub != 1 && sub != 2 {
        return Ok(());
    }
    let descriptor = planned(task, &state.xfr, chunk)?;
    record_move::move_revert(tx, &descriptor.record_ids())
}

fn check_capacity(
    tx: &dyn Transaction,
    state: &MovePayload,
    descriptor: &transfer::TransferDescriptor,
) -> Result<()> {
    let alloc = tx.allocation(&state.owner, &state.dst_repo)?.ok_or_else(|| {
        Error::InternalFault(format!(
            "{} has no allocation on {}",
            state.owner, state.dst_repo
        ))
    })?;

    let count = u64::try_from(descriptor.files.len()).unwrap_or(u64::MAX);
    if alloc.rec_count.saturating_add(count) > alloc.rec_limit {
        return Err(Error::AllocationExceeded(format!(
            "allocation record count limit exceeded on {}",
            state.dst_repo
        )));
    }
    if alloc.data_size.saturating_add(descriptor.size) > alloc.data_limit {
        return Err(Error::AllocationExceeded(format!(
            "allocation data size limit exceeded on {}",
            state.dst_repo
        )));
    }
    Ok(())
}
