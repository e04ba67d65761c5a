//! Startup reconciliation of persisted state with the requested run.
//!
//! Runs once, before any item is touched. Steps left `in_progress` by a
//! dead writer are reset to `pending` (never trusted as complete); `failed`
//! steps within the attempt budget are picked up again by the registry
//! without a status change; a provider/model override re-queues `describe`
//! for items the new producer has not described yet, keeping every prior
//! result entry.

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::io::store::Store;
use crate::manifest::{DescribeProfile, RunStatus, StepKind, StepStatus};
use crate::core::transitions;

/// Optional configuration overrides supplied at resume time.
#[derive(Debug, Clone, Default)]
pub struct ResumeOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
}

impl ResumeOverrides {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.model.is_none() && self.prompt.is_none()
    }

    fn apply_to(&self, profile: &DescribeProfile) -> DescribeProfile {
        DescribeProfile {
            provider: self
                .provider
                .clone()
                .unwrap_or_else(|| profile.provider.clone()),
            model: self.model.clone().unwrap_or_else(|| profile.model.clone()),
            prompt: self
                .prompt
                .clone()
                .unwrap_or_else(|| profile.prompt.clone()),
        }
    }
}

/// What reconciliation changed and what remains to do.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// (item, step) pairs reset from `in_progress` to `pending`.
    pub interrupted_reset: Vec<(String, StepKind)>,
    /// (item, step) pairs still `failed` with attempt budget remaining.
    pub failed_requeued: Vec<(String, StepKind)>,
    /// Items whose `describe` was re-queued for a new producer.
    pub describe_requeued: Vec<String>,
    /// Items already fully settled and excluded from the work list.
    pub settled: usize,
}

/// Reconcile an opened write-mode store. Mutations are committed through the
/// normal store path, so a crash during reconciliation is itself resumable.
pub fn reconcile(
    store: &mut Store,
    overrides: &ResumeOverrides,
    max_attempts: u32,
) -> Result<ReconcilePlan> {
    let mut plan = ReconcilePlan::default();

    let current_profile = store.manifest().describe.clone();
    let next_profile = overrides.apply_to(&current_profile);
    let producer_changed = next_profile.producer() != current_profile.producer();

    if next_profile != current_profile {
        info!(
            producer = %next_profile.producer(),
            "applying configuration override"
        );
        store.commit_manifest_update(|manifest| {
            manifest.describe = next_profile.clone();
            Ok(())
        })?;
    }

    let ids = store.manifest().ordered_item_ids();
    for id in &ids {
        let item = store
            .get_item(id)
            .ok_or_else(|| anyhow!("unknown item '{id}'"))?
            .clone();

        let interrupted = item.in_flight();
        let requeue_describe = producer_changed
            && item.status(StepKind::Describe) == StepStatus::Completed
            && !item.results.iter().any(|entry| {
                entry.step == StepKind::Describe && entry.producer == next_profile.producer()
            });

        if interrupted.is_some() || requeue_describe {
            store.commit_item_update(id, |record| {
                if let Some(step) = interrupted {
                    transitions::reset_interrupted(record, step).map_err(|err| anyhow!(err))?;
                }
                if requeue_describe {
                    transitions::requeue_describe(record).map_err(|err| anyhow!(err))?;
                }
                Ok(())
            })?;
        }

        if let Some(step) = interrupted {
            debug!(item = %id, step = step.as_str(), "interrupted step reset to pending");
            plan.interrupted_reset.push((id.clone(), step));
        }
        if requeue_describe {
            plan.describe_requeued.push(id.clone());
        }

        let item = store
            .get_item(id)
            .ok_or_else(|| anyhow!("unknown item '{id}'"))?;
        for (step, status) in &item.steps {
            if *status == StepStatus::Failed && item.attempts_for(*step) < max_attempts {
                plan.failed_requeued.push((id.clone(), *step));
            }
        }
        if item.is_settled() {
            plan.settled += 1;
        }
    }

    if store.manifest().status != RunStatus::Running {
        store.commit_manifest_update(|manifest| {
            manifest.status = RunStatus::Running;
            Ok(())
        })?;
    }

    info!(
        interrupted = plan.interrupted_reset.len(),
        failed_requeued = plan.failed_requeued.len(),
        describe_requeued = plan.describe_requeued.len(),
        settled = plan.settled,
        "run reconciled"
    );
    Ok(plan)
}
