//! Static step registry and deterministic next-step selection.

use crate::manifest::{ItemRecord, MediaKind, StepKind, StepStatus};

/// Per-item steps in execution order. `render` is run-level and not listed.
pub const ITEM_STEPS: [StepKind; 3] = [
    StepKind::ExtractFrames,
    StepKind::Convert,
    StepKind::Describe,
];

/// What the executor should do next for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPlan {
    /// Invoke the collaborator bound to this step.
    Run(StepKind),
    /// The step does not apply to this item; record it as skipped.
    Skip(StepKind),
}

/// Whether a step can ever produce output for this item.
fn applies(step: StepKind, item: &ItemRecord) -> bool {
    match step {
        StepKind::ExtractFrames => item.kind == MediaKind::Video,
        // Videos resolve through extracted frames, which are already canonical.
        StepKind::Convert => item.kind == MediaKind::Image && item.resolved_path.is_none(),
        StepKind::Describe => item.resolved_path.is_some(),
        StepKind::Render => false,
    }
}

/// Select the next step for `item`, or `None` when the item is fully
/// processed or terminally failed.
///
/// Pure and total for any well-formed record: walks [`ITEM_STEPS`] in order,
/// passing over terminal statuses. A `failed` step is re-planned while its
/// attempt count is under `max_attempts` and otherwise ends the item (later
/// steps would consume its missing output). A step that cannot apply —
/// including `describe` when no describable image emerged from the earlier
/// steps — is planned as [`StepPlan::Skip`].
pub fn next_step(item: &ItemRecord, max_attempts: u32) -> Option<StepPlan> {
    if item.kind == MediaKind::Unsupported {
        return None;
    }

    for step in ITEM_STEPS {
        match item.status(step) {
            StepStatus::Completed | StepStatus::Skipped => continue,
            StepStatus::Failed => {
                if item.attempts_for(step) < max_attempts {
                    return Some(StepPlan::Run(step));
                }
                return None;
            }
            StepStatus::Pending | StepStatus::InProgress => {
                if !applies(step, item) {
                    return Some(StepPlan::Skip(step));
                }
                return Some(StepPlan::Run(step));
            }
        }
    }

    None
}
