//! Semantic manifest invariants, checked on load and before every commit.

use crate::manifest::{MediaKind, RunManifest, StepKind, StepStatus};

/// Validate manifest invariants. Returns human-readable violations; an empty
/// vector means the document is well-formed.
pub fn validate_invariants(manifest: &RunManifest) -> Vec<String> {
    let mut errors = Vec::new();

    if manifest.run_id.trim().is_empty() {
        errors.push("run_id must not be empty".to_string());
    }
    if manifest.steps.is_empty() {
        errors.push("steps must not be empty".to_string());
    }

    for (key, item) in &manifest.items {
        if *key != item.id {
            errors.push(format!(
                "item key '{}' does not match record id '{}'",
                key, item.id
            ));
        }

        let in_flight = item
            .steps
            .values()
            .filter(|status| **status == StepStatus::InProgress)
            .count();
        if in_flight > 1 {
            errors.push(format!(
                "item '{}' has {} steps in progress (at most one allowed)",
                item.id, in_flight
            ));
        }

        if item.kind == MediaKind::Unsupported && !item.steps.is_empty() {
            errors.push(format!(
                "unsupported item '{}' must not carry step statuses",
                item.id
            ));
        }

        if item.status(StepKind::Describe) == StepStatus::Completed {
            if item.resolved_path.is_none() {
                errors.push(format!(
                    "item '{}' completed describe without a resolved path",
                    item.id
                ));
            }
            if !item
                .results
                .iter()
                .any(|entry| entry.step == StepKind::Describe)
            {
                errors.push(format!(
                    "item '{}' completed describe without a result entry",
                    item.id
                ));
            }
        }
    }

    errors
}
