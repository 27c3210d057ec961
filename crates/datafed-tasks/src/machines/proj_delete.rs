//! Project delete: `0` remove every project with its records, collections
//! and allocations, `1..=n` one ALLOC_DELETE per allocation, `n+1` finish.
//!
//! Step `0` is a point of no return.

use super::rec_coll_delete::delete_record;
use super::{payload_mismatch, planned, steps_for, StepContext, StepOutcome, StepRunner};
use crate::error::Result;
use crate::task::{Command, TaskPayload, TaskType};
use crate::transfer::AllocTarget;

/// State machine for [`TaskType::ProjDelete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjDelete;

impl StepRunner for ProjDelete {
    fn task_type(&self) -> TaskType {
        TaskType::ProjDelete
    }

    fn plan(&self, ctx: &mut StepContext<'_>) -> Result<i64> {
        let TaskPayload::ProjDelete(state) = &mut ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };

        let mut allocs = Vec::new();
        for project in &state.projects {
            let held = ctx.tx.allocations_of(project)?;
            for id in ctx.tx.owned_records(project)? {
                delete_record(ctx.tx, &id)?;
            }
            for id in ctx.tx.owned_collections(project)? {
                ctx.tx.remove_collection(&id)?;
            }
            for alloc in held {
                ctx.tx.remove_allocation(project, &alloc.repo)?;
                allocs.push(AllocTarget {
                    repo_id: alloc.repo,
                    repo_path: alloc.path,
                });
            }
            ctx.tx.remove_project(project)?;
            tracing::info!(project = %project, "deleted project");
        }

        state.allocs = allocs;
        steps_for(state.allocs.len(), 1, 2)
    }

    fn step(&self, ctx: &mut StepContext<'_>, step: i64) -> Result<StepOutcome> {
        let TaskPayload::ProjDelete(state) = &ctx.task.payload else {
            return Err(payload_mismatch(ctx.task));
        };
        let target = planned(ctx.task, &state.allocs, step - 1)?;
        Ok(StepOutcome::Command(Command::AllocDelete(target)))
    }
}
