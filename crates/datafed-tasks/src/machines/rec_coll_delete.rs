//! Record and collection delete: `0` remove the metadata, `1..=n` one
//! RAW_DATA_DELETE per repository directory, `n+1` finish.
//!
//! Step `0` is a point of no return: once the records are gone the raw data
//! is orphaned, so a failing delete command only fails the task.

use datafed_core::RecordId;

use super::{payload_mismatch, planned, steps_for, StepContext, StepOutcome, StepRunner};
use crate::error::Result;
use crate::store::Transaction;
use crate::task::{Command, TaskPayload, TaskType};
use crate::transfer;

/// State machine for [`TaskType::RecCollDelete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RecCollDelete;

/// Removes a record and releases its share of the holding allocation.
pub(crate) fn delete_record(tx: &mut dyn Transaction, id: &RecordId) -> Result<()> {
    let Some(rec) = tx.record(id)? else {
        return Ok(());
    };
    if let Some(loc) = tx.location(id)? {
        if let Some(mut alloc) = tx.allocation(&loc.uid, &loc.repo)? {
            alloc.rec_count = alloc.rec_count.saturating_sub(1);
            alloc.data_size = alloc.data_size.saturating_sub(rec.size);
            tx.put_allocation(alloc)?;
        }
    }
    tx.remove_record(id)
}

impl StepRunner for RecCollDelete {
    fn task_type(&self) -> TaskType {
        TaskType::RecCollDelete
    }

    fn plan(&self, ctx: &mut StepContext<'_>) -> Result<i64> {
        let TaskPayload::RecCollDelete(state) = &mut ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        state.del_data = transfer::plan_delete(ctx.tx, &state.records)?;
        for id in &state.records {
            delete_record(ctx.tx, id)?;
        }
        for id in &state.collections {
            ctx.tx.remove_collection(id)?;
        }
        tracing::info!(
            records = state.records.len(),
            collections = state.collections.len(),
            "deleted metadata"
        );
        steps_for(state.del_data.len(), 1, 2)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::RecCollDelete(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        let files = planned(ctx.task, &state.del_data, step - 1)?;
        Ok(StepOutcome::Command(Command::RawDataDelete(files)))
    }
}
