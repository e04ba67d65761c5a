//! Executor-owned step status transitions.
//!
//! Every status change funnels through these functions so the forward-only
//! contract (`pending → in_progress → {completed, failed, skipped}`, retry
//! via `failed → in_progress`) and the one-in-flight-per-item rule hold no
//! matter which orchestration path commits the change. The two reset
//! functions at the bottom exist solely for resume reconciliation.

use std::path::PathBuf;

use crate::manifest::{ItemError, ItemRecord, ResultEntry, StepKind, StepStatus};

/// Mark `step` in progress. Valid from `pending` (or unplanned) and from
/// `failed` (retry); refuses while any step of the item is in flight.
pub fn begin_step(item: &mut ItemRecord, step: StepKind) -> Result<(), String> {
    if let Some(flying) = item.in_flight() {
        return Err(format!(
            "item '{}': step '{}' is already in progress",
            item.id,
            flying.as_str()
        ));
    }
    match item.status(step) {
        StepStatus::Pending | StepStatus::Failed => {
            item.steps.insert(step, StepStatus::InProgress);
            Ok(())
        }
        status => Err(invalid(item, step, status, StepStatus::InProgress)),
    }
}

/// Record a successful step: append its result entry and mark `completed`
/// in the same mutation, so the entry is durable before the status is
/// observable.
pub fn complete_step(
    item: &mut ItemRecord,
    step: StepKind,
    entry: ResultEntry,
    resolved: Option<PathBuf>,
) -> Result<(), String> {
    match item.status(step) {
        StepStatus::InProgress => {
            item.results.push(entry);
            if let Some(path) = resolved {
                item.resolved_path = Some(path);
            }
            item.steps.insert(step, StepStatus::Completed);
            item.last_error = None;
            Ok(())
        }
        status => Err(invalid(item, step, status, StepStatus::Completed)),
    }
}

/// Mark a step skipped: either it never applied to this item, or it ran and
/// produced nothing usable.
pub fn skip_step(item: &mut ItemRecord, step: StepKind) -> Result<(), String> {
    match item.status(step) {
        StepStatus::Pending | StepStatus::InProgress => {
            item.steps.insert(step, StepStatus::Skipped);
            Ok(())
        }
        status => Err(invalid(item, step, status, StepStatus::Skipped)),
    }
}

/// Record a collaborator failure: bump the attempt counter and keep the
/// message for diagnosis.
pub fn fail_step(item: &mut ItemRecord, step: StepKind, message: String) -> Result<(), String> {
    match item.status(step) {
        StepStatus::InProgress => {
            let attempts = item.attempts_for(step) + 1;
            item.attempts.insert(step, attempts);
            item.last_error = Some(ItemError { step, message });
            item.steps.insert(step, StepStatus::Failed);
            Ok(())
        }
        status => Err(invalid(item, step, status, StepStatus::Failed)),
    }
}

/// Resume-only: a step left `in_progress` by a dead writer is never trusted
/// as complete and goes back to `pending` for re-execution.
pub fn reset_interrupted(item: &mut ItemRecord, step: StepKind) -> Result<(), String> {
    match item.status(step) {
        StepStatus::InProgress => {
            item.steps.insert(step, StepStatus::Pending);
            Ok(())
        }
        status => Err(invalid(item, step, status, StepStatus::Pending)),
    }
}

/// Resume-only: re-queue a completed `describe` for a new producer. Prior
/// result entries are kept; the new producer appends alongside them.
pub fn requeue_describe(item: &mut ItemRecord) -> Result<(), String> {
    match item.status(StepKind::Describe) {
        StepStatus::Completed => {
            item.steps.insert(StepKind::Describe, StepStatus::Pending);
            item.attempts.insert(StepKind::Describe, 0);
            Ok(())
        }
        status => Err(invalid(
            item,
            StepKind::Describe,
            status,
            StepStatus::Pending,
        )),
    }
}

fn invalid(item: &ItemRecord, step: StepKind, from: StepStatus, to: StepStatus) -> String {
    format!(
        "item '{}': invalid transition for step '{}': {:?} -> {:?}",
        item.id,
        step.as_str(),
        from,
        to
    )
}
