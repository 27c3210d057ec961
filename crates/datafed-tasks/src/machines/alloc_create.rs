//! Allocation create: `0` plan, `1` ALLOC_CREATE, `2` save the allocation.
//!
//! The allocation document is written only after the worker created the
//! storage directory, so a failed command leaves nothing to undo.

use datafed_core::TaskId;

use super::{out_of_range, payload_mismatch, StepContext, StepOutcome, StepRunner};
use crate::admission;
use crate::error::{Error, Result};
use crate::model::Allocation;
use crate::task::{Command, TaskPayload, TaskType};
use crate::transfer::AllocTarget;

/// State machine for [`TaskType::AllocCreate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocCreate;

impl StepRunner for AllocCreate {
    fn task_type(&self) -> TaskType {
        TaskType::AllocCreate
    }

    fn plan(&self, _ctx: &mut StepContext<'_>) -> Result<i64> {
        Ok(3)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::AllocCreate(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        match step {
            1 => Ok(StepOutcome::Command(Command::AllocCreate(AllocTarget {
                repo_id: state.repo_id.clone(),
                repo_path: state.repo_path.clone(),
            }))),
            _ => Err(out_of_range(ctx.task, step)),
        }
    }

    fn finalize(&self, ctx: &mut StepContext<'_>) -> Result<Vec<TaskId>> {
        let TaskPayload::AllocCreate(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        if ctx.tx.allocation(&state.subject, &state.repo_id)?.is_some() {
            return Err(Error::InvalidParam(format!(
                "{} already has an allocation on {}",
                state.subject, state.repo_id
            )));
        }
        ctx.tx.put_allocation(Allocation {
            subject: state.subject.clone(),
            repo: state.repo_id.clone(),
            data_limit: state.data_limit,
            rec_limit: state.rec_limit,
            rec_count: 0,
            data_size: 0,
            path: state.repo_path.clone(),
        })?;
        admission::complete(ctx.tx, &ctx.task.id, true, None)
    }
}
