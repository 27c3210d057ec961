//! Data put: `0` plan, `1..=n` RAW_DATA_TRANSFER, `n+1` record the new
//! source, then one RAW_DATA_UPDATE_SIZE per repository directory holding a
//! target record, then finish.
//!
//! Step `n+1` overwrites the record's source and extension. There is no
//! earlier value to restore, so it is a point of no return.

use chrono::Utc;

use super::{
    out_of_range, payload_mismatch, planned, steps_for, transfer_command, StepContext,
    StepOutcome, StepRunner,
};
use crate::error::{Error, Result};
use crate::store::Transaction;
use crate::task::{Command, PutPayload, TaskPayload, TaskType};
use crate::transfer;

/// State machine for [`TaskType::DataPut`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPut;

/// Extension of the file named by `path`, including the leading dot.
fn derived_ext(path: &str) -> Option<String> {
    let name = path.rsplit_once('/').map_or(path, |(_, name)| name);
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => Some(name[idx..].to_string()),
        _ => None,
    }
}

fn record_source(tx: &mut dyn Transaction, state: &PutPayload) -> Result<()> {
    for rec in &state.glob_data {
        let mut doc = tx.require_record(&rec.id)?;
        doc.source = Some(state.path.clone());
        match &state.ext {
            Some(ext) => {
                doc.ext = Some(ext.clone());
                doc.ext_auto = false;
            }
            None if doc.ext_auto => doc.ext = derived_ext(&state.path),
            None => {}
        }
        doc.updated_at = Utc::now();
        tx.put_record(doc)?;
    }
    Ok(())
}

impl StepRunner for DataPut {
    fn task_type(&self) -> TaskType {
        TaskType::DataPut
    }

    fn plan(&self, ctx: &mut StepContext<'_>) -> Result<i64> {
        let TaskPayload::DataPut(state) = &mut ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        state.xfr = transfer::plan_put(ctx.tx, &state.glob_data, &state.path)?;
        let ids: Vec<_> = state.glob_data.iter().map(|r| r.id.clone()).collect();
        state.sizes = transfer::plan_delete(ctx.tx, &ids)?;
        if state.sizes.is_empty() {
            return Err(Error::InternalFault(
                "uploaded record has no storage location".into(),
            ));
        }
        let transfers = steps_for(state.xfr.len(), 1, 0)?;
        let updates = steps_for(state.sizes.len(), 1, 0)?;
        Ok(transfers + updates + 2)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::DataPut(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        let transfers = steps_for(state.xfr.len(), 1, 0)?;

        if step <= transfers {
            let descriptor = planned(ctx.task, &state.xfr, step - 1)?;
            let command = transfer_command(ctx.tx, ctx.task, state.encrypt, descriptor)?;
            return Ok(StepOutcome::Command(command));
        }
        if step > ctx.task.steps - 2 {
            return Err(out_of_range(ctx.task, step));
        }

        let update = step - transfers - 1;
        if update == 0 {
            record_source(ctx.tx, state)?;
        }
        let files = planned(ctx.task, &state.sizes, update)?;
        Ok(StepOutcome::Command(Command::RawDataUpdateSize(files)))
    }
}
