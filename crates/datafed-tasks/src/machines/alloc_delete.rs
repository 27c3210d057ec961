//! Allocation delete: `0` plan, `1` drop the allocation and emit
//! ALLOC_DELETE, `2` finish.
//!
//! If the worker cannot delete the storage, rollback restores the allocation
//! document from the limits captured at init.

use super::{out_of_range, payload_mismatch, StepContext, StepOutcome, StepRunner};
use crate::error::Result;
use crate::model::Allocation;
use crate::task::{Command, TaskPayload, TaskType};
use crate::transfer::AllocTarget;

/// State machine for [`TaskType::AllocDelete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocDelete;

impl StepRunner for AllocDelete {
    fn task_type(&self) -> TaskType {
        TaskType::AllocDelete
    }

    fn plan(&self, _ctx: &mut StepContext<'_>) -> Result<i64> {
        Ok(3)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::AllocDelete(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        if step != 1 {
            return Err(out_of_range(ctx.task, step));
        }
        ctx.tx.remove_allocation(&state.subject, &state.repo_id)?;
        Ok(StepOutcome::Command(Command::AllocDelete(AllocTarget {
            repo_id: state.repo_id.clone(),
            repo_path: state.repo_path.clone(),
        })))
    }

    fn rollback(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<()> {
        let TaskPayload::AllocDelete(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        if step != 1 || ctx.tx.allocation(&state.subject, &state.repo_id)?.is_some() {
            return Ok(());
        }
        tracing::info!(subject = %state.subject, repo = %state.repo_id, "restoring allocation");
        ctx.tx.put_allocation(Allocation {
            subject: state.subject.clone(),
            repo: state.repo_id.clone(),
            data_limit: state.data_limit,
            rec_limit: state.rec_limit,
            rec_count: 0,
            data_size: 0,
            path: state.repo_path.clone(),
        })
    }
}
