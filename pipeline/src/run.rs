//! Orchestration for `pipeline run` and `pipeline resume`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::classify::classify;
use crate::core::stats::aggregate;
use crate::executor::{ExecutorLimits, StepBindings, StopFlag, run_items};
use crate::io::config::{PipelineConfig, load_config, write_config};
use crate::io::report::write_report;
use crate::io::scan::scan_input_root;
use crate::io::store::{OpenMode, Store};
use crate::manifest::{DescribeProfile, ItemRecord, RunManifest, RunStatus};
use crate::resume::{ResumeOverrides, reconcile};

/// Parameters for starting a new run.
#[derive(Debug, Clone)]
pub struct NewRunRequest {
    pub input_root: PathBuf,
    pub run_dir: PathBuf,
    pub config: PipelineConfig,
}

/// Final accounting for one `run`/`resume` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    pub scan_warnings: usize,
}

/// Start a new run: scan, classify, create the store, process every item.
pub fn start_run(
    request: &NewRunRequest,
    bindings: &StepBindings<'_>,
    stop: &StopFlag,
) -> Result<RunSummary> {
    request.config.validate()?;

    let input_root = request
        .input_root
        .canonicalize()
        .with_context(|| format!("canonicalize {}", request.input_root.display()))?;

    let scanned = scan_input_root(&input_root, request.config.recursive)?;
    for warning in &scanned.warnings {
        warn!(path = ?warning.path, message = %warning.message, "scan warning");
    }

    let candidates = classify(&scanned.files, &request.config.extensions());
    info!(
        items = candidates.len(),
        warnings = scanned.warnings.len(),
        "input classified"
    );

    let profile = DescribeProfile {
        provider: request.config.provider.clone(),
        model: request.config.model.clone(),
        prompt: request.config.prompt.clone(),
    };
    let mut manifest = RunManifest::new(
        generate_run_id(),
        input_root.clone(),
        profile,
        Utc::now(),
    );
    for candidate in candidates {
        let mut record = ItemRecord::new(candidate.id, candidate.source_path, candidate.kind);
        if candidate.canonical {
            // Already describable: the source itself is the resolved image.
            record.resolved_path = Some(input_root.join(&record.source_path));
        }
        manifest.items.insert(record.id.clone(), record);
    }

    let mut store = Store::create(&request.run_dir, manifest)?;
    write_config(&store.paths().config_path, &request.config)?;

    execute(&mut store, &request.config, bindings, stop, scanned.warnings.len())
}

/// Resume an existing run directory, optionally with overrides.
pub fn resume_run(
    run_dir: &Path,
    overrides: &ResumeOverrides,
    bindings: &StepBindings<'_>,
    stop: &StopFlag,
) -> Result<RunSummary> {
    let mut store = Store::open(run_dir, OpenMode::Write)?;
    let config = load_config(&store.paths().config_path)?;

    let plan = reconcile(&mut store, overrides, config.max_attempts)?;
    debug!(?plan, "resume plan computed");

    execute(&mut store, &config, bindings, stop, 0)
}

fn execute(
    store: &mut Store,
    config: &PipelineConfig,
    bindings: &StepBindings<'_>,
    stop: &StopFlag,
    scan_warnings: usize,
) -> Result<RunSummary> {
    let limits = ExecutorLimits::from_config(config);

    let result = run_items(store, bindings, &limits, stop, |id, state| {
        debug!(item = %id, ?state, "item finished");
    });

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            // Best-effort terminal status; the original error still propagates.
            let _ = store.commit_manifest_update(|manifest| {
                manifest.status = RunStatus::Failed;
                Ok(())
            });
            return Err(err);
        }
    };

    let status = if outcome.aborted {
        RunStatus::Aborted
    } else {
        RunStatus::Completed
    };
    store.commit_manifest_update(|manifest| {
        manifest.status = status;
        Ok(())
    })?;

    // Run-level render step: pure formatting over the final snapshot.
    let snapshot = store.snapshot()?;
    let stats = aggregate(&snapshot, Utc::now());
    write_report(&store.paths().report_path, &snapshot, &stats)?;

    let summary = RunSummary {
        run_id: snapshot.run_id.clone(),
        status,
        total_items: snapshot.items.len(),
        completed: snapshot.completed_count(),
        failed: snapshot.failed_count(),
        scan_warnings,
    };
    info!(
        run_id = %summary.run_id,
        ?status,
        completed = summary.completed,
        failed = summary.failed,
        "run finished"
    );
    Ok(summary)
}

fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix: u16 = rand::random();
    format!("run-{stamp}-{suffix:04x}")
}
