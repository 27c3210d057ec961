//! Record allocation change: `0` plan chunks, then per chunk a capacity
//! check, the transfer, the bookkeeping update and the source delete, then
//! finish.
//!
//! Total steps: `4 * chunks + 2`.

use super::chunked::{self, STEPS_PER_CHUNK};
use super::{out_of_range, payload_mismatch, steps_for, StepContext, StepOutcome, StepRunner};
use crate::error::Result;
use crate::task::{TaskPayload, TaskType};

/// State machine for [`TaskType::RecAllocChange`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RecAllocChange;

impl StepRunner for RecAllocChange {
    fn task_type(&self) -> TaskType {
        TaskType::RecAllocChange
    }

    fn plan(&self, ctx: &mut StepContext<'_>) -> Result<i64> {
        let TaskPayload::RecAllocChange(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        let xfr = chunked::plan(ctx.tx, ctx.config, ctx.metrics, ctx.task, state, false)?;
        let steps = steps_for(xfr.len(), STEPS_PER_CHUNK, 2)?;
        if let TaskPayload::RecAllocChange(state) = &mut ctx.task.payload {
            state.xfr = xfr;
        }
        Ok(steps)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::RecAllocChange(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        if step < 1 || step > ctx.task.steps - 2 {
            return Err(out_of_range(ctx.task, step));
        }
        let (chunk, sub) = ((step - 1) / STEPS_PER_CHUNK, (step - 1) % STEPS_PER_CHUNK);
        chunked::step(ctx.tx, ctx.task, state, chunk, sub, false)
    }

    fn rollback(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<()> {
        let TaskPayload::RecAllocChange(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        if step < 1 || step > ctx.task.steps - 2 {
            return Ok(());
        }
        let (chunk, sub) = ((step - 1) / STEPS_PER_CHUNK, (step - 1) % STEPS_PER_CHUNK);
        chunked::rollback(ctx.tx, ctx.task, state, chunk, sub)
    }
}
