//! Record ownership change: `0` plan chunks, `1` re-own external records,
//! four steps per managed chunk, then finish.
//!
//! Total steps: `4 * chunks + 3`. Step `1` clears ACLs and re-parents the
//! external records; it is a point of no return.

use super::chunked::{self, STEPS_PER_CHUNK};
use super::{out_of_range, payload_mismatch, steps_for, StepContext, StepOutcome, StepRunner};
use crate::error::{Error, Result};
use crate::record_move;
use crate::task::{TaskPayload, TaskType};

/// State machine for [`TaskType::RecOwnerChange`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RecOwnerChange;

impl StepRunner for RecOwnerChange {
    fn task_type(&self) -> TaskType {
        TaskType::RecOwnerChange
    }

    fn plan(&self, ctx: &mut StepContext<'_>) -> Result<i64> {
        let TaskPayload::RecOwnerChange(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        let xfr = chunked::plan(ctx.tx, ctx.config, ctx.metrics, ctx.task, state, true)?;
        let steps = steps_for(xfr.len(), STEPS_PER_CHUNK, 3)?;
        if let TaskPayload::RecOwnerChange(state) = &mut ctx.task.payload {
            state.xfr = xfr;
        }
        Ok(steps)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::RecOwnerChange(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        if step == 1 {
            let coll = state.dst_coll.as_ref().ok_or_else(|| {
                Error::InternalFault("ownership change without destination collection".into())
            })?;
            let ids: Vec<_> = state.ext_data.iter().map(|r| r.id.clone()).collect();
            record_move::move_external(ctx.tx, &ids, &state.owner, coll)?;
            return Ok(StepOutcome::Advance);
        }
        if step < 2 || step > ctx.task.steps - 2 {
            return Err(out_of_range(ctx.task, step));
        }
        let (chunk, sub) = ((step - 2) / STEPS_PER_CHUNK, (step - 2) % STEPS_PER_CHUNK);
        chunked::step(ctx.tx, ctx.task, state, chunk, sub, true)
    }

    fn rollback(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<()> {
        let TaskPayload::RecOwnerChange(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        if step < 2 || step > ctx.task.steps - 2 {
            return Ok(());
        }
        let (chunk, sub) = ((step - 2) / STEPS_PER_CHUNK, (step - 2) % STEPS_PER_CHUNK);
        chunked::rollback(ctx.tx, ctx.task, state, chunk, sub)
    }
}
