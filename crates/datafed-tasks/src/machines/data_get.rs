//! Data get: `0` plan transfers, `1..=n` one RAW_DATA_TRANSFER per source,
//! `n+1` finish. Downloads change nothing locally, so rollback is empty.

use super::{
    payload_mismatch, planned, steps_for, transfer_command, StepContext, StepOutcome, StepRunner,
};
use crate::error::Result;
use crate::task::{TaskPayload, TaskType};
use crate::transfer;

/// State machine for [`TaskType::DataGet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DataGet;

impl StepRunner for DataGet {
    fn task_type(&self) -> TaskType {
        TaskType::DataGet
    }

    fn plan(&self, ctx: &mut StepContext<'_>) -> Result<i64> {
        let TaskPayload::DataGet(state) = &mut ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        state.xfr = transfer::plan_get(
            ctx.tx,
            &state.glob_data,
            &state.ext_data,
            &state.path,
            state.orig_fname,
        )?;
        ctx.metrics
            .observe_transfer_chunks(TaskType::DataGet.as_label(), state.xfr.len());
        steps_for(state.xfr.len(), 1, 2)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::DataGet(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        let descriptor = planned(ctx.task, &state.xfr, step - 1)?;
        let command = transfer_command(ctx.tx, ctx.task, state.encrypt, descriptor)?;
        Ok(StepOutcome::Command(command))
    }
}
