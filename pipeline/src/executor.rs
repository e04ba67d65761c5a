//! Pipeline executor: drives each item through the step state machine.
//!
//! Every status transition is committed through the store before and after
//! the collaborator call, so an interruption at any point leaves either the
//! previous durable state or the new one. A step interrupted between
//! "collaborator returned" and "commit returned" stays `in_progress` and is
//! re-run on resume; collaborators write deterministic artifact paths, so
//! the re-run overwrites identical outputs.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::registry::{StepPlan, next_step};
use crate::core::transitions;
use crate::io::collaborator::{Collaborator, StepOutput, StepRequest};
use crate::io::config::PipelineConfig;
use crate::io::prompt::PromptBuilder;
use crate::io::store::Store;
use crate::manifest::{ItemRecord, ResultEntry, StepKind};

/// Collaborators bound to each per-item step.
pub struct StepBindings<'a> {
    pub extract: &'a dyn Collaborator,
    pub convert: &'a dyn Collaborator,
    pub describe: &'a dyn Collaborator,
}

impl StepBindings<'_> {
    fn for_step(&self, step: StepKind) -> Result<&dyn Collaborator> {
        match step {
            StepKind::ExtractFrames => Ok(self.extract),
            StepKind::Convert => Ok(self.convert),
            StepKind::Describe => Ok(self.describe),
            StepKind::Render => Err(anyhow!("render has no per-item collaborator")),
        }
    }
}

/// Cooperative run-stop signal, checked before every step.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executor limits derived from [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub max_attempts: u32,
    pub step_timeout: Duration,
    pub output_limit_bytes: usize,
    pub canonical_format: String,
}

impl ExecutorLimits {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            step_timeout: Duration::from_secs(cfg.step_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            canonical_format: cfg.canonical_format.clone(),
        }
    }
}

/// Terminal state of one item after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// All planned steps completed or were skipped.
    Completed,
    /// Some step exhausted its attempt budget.
    Failed,
    /// The stop flag interrupted this item; safe to resume later.
    Aborted,
}

/// Summary of one `run_items` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub aborted: bool,
}

/// Drive one item through its remaining steps.
pub fn process_item(
    store: &mut Store,
    bindings: &StepBindings<'_>,
    limits: &ExecutorLimits,
    stop: &StopFlag,
    item_id: &str,
) -> Result<ItemState> {
    let prompts = PromptBuilder::new();

    loop {
        if stop.is_set() {
            return Ok(ItemState::Aborted);
        }

        let item = store
            .get_item(item_id)
            .ok_or_else(|| anyhow!("unknown item '{item_id}'"))?
            .clone();

        let Some(plan) = next_step(&item, limits.max_attempts) else {
            break;
        };

        match plan {
            StepPlan::Skip(step) => {
                debug!(item = %item.id, step = step.as_str(), "step does not apply, skipping");
                store.commit_item_update(item_id, |record| {
                    transitions::skip_step(record, step).map_err(|err| anyhow!(err))
                })?;
            }
            StepPlan::Run(step) => {
                store.commit_item_update(item_id, |record| {
                    transitions::begin_step(record, step).map_err(|err| anyhow!(err))
                })?;

                let producer = producer_for(store, step);
                let request = build_request(store, &prompts, &item, step, limits)?;
                let started = Instant::now();
                let outcome = bindings.for_step(step)?.run(&request);
                let duration_ms = started.elapsed().as_millis() as u64;

                match outcome {
                    Ok(StepOutput::Produced { payload, resolved }) => {
                        let entry = ResultEntry {
                            recorded_at: Utc::now(),
                            step,
                            payload,
                            producer,
                            duration_ms,
                        };
                        store.commit_item_update(item_id, |record| {
                            transitions::complete_step(record, step, entry, resolved)
                                .map_err(|err| anyhow!(err))
                        })?;
                        debug!(item = %item.id, step = step.as_str(), duration_ms, "step completed");
                    }
                    Ok(StepOutput::Empty { note }) => {
                        info!(item = %item.id, step = step.as_str(), note = %note, "step produced nothing, skipping");
                        store.commit_item_update(item_id, |record| {
                            transitions::skip_step(record, step).map_err(|err| anyhow!(err))
                        })?;
                    }
                    Err(err) => {
                        warn!(item = %item.id, step = step.as_str(), error = %err, "step failed");
                        let message = format!("{err:#}");
                        store.commit_item_update(item_id, |record| {
                            transitions::fail_step(record, step, message).map_err(|e| anyhow!(e))
                        })?;
                    }
                }
            }
        }
    }

    let item = store
        .get_item(item_id)
        .ok_or_else(|| anyhow!("unknown item '{item_id}'"))?;
    if item.has_failed_step() {
        Ok(ItemState::Failed)
    } else {
        Ok(ItemState::Completed)
    }
}

/// Process every item in classifier order. Per-item failures never abort the
/// run; a set stop flag ends it between steps.
pub fn run_items<F>(
    store: &mut Store,
    bindings: &StepBindings<'_>,
    limits: &ExecutorLimits,
    stop: &StopFlag,
    mut on_item: F,
) -> Result<RunOutcome>
where
    F: FnMut(&str, ItemState),
{
    let ids = store.manifest().ordered_item_ids();
    let mut outcome = RunOutcome::default();

    for id in ids {
        if stop.is_set() {
            outcome.aborted = true;
            break;
        }
        let state = process_item(store, bindings, limits, stop, &id)
            .with_context(|| format!("process item '{id}'"))?;
        if state == ItemState::Aborted {
            outcome.aborted = true;
            break;
        }
        outcome.processed += 1;
        match state {
            ItemState::Completed => outcome.completed += 1,
            ItemState::Failed => outcome.failed += 1,
            ItemState::Aborted => {}
        }
        on_item(&id, state);
    }

    Ok(outcome)
}

fn producer_for(store: &Store, step: StepKind) -> String {
    match step {
        StepKind::Describe => store.manifest().describe.producer(),
        other => other.as_str().to_string(),
    }
}

fn build_request<'a>(
    store: &Store,
    prompts: &PromptBuilder,
    item: &'a ItemRecord,
    step: StepKind,
    limits: &ExecutorLimits,
) -> Result<StepRequest<'a>> {
    let manifest = store.manifest();
    let input_path: PathBuf = match step {
        StepKind::Describe => item
            .resolved_path
            .clone()
            .ok_or_else(|| anyhow!("item '{}' has no describable image", item.id))?,
        _ => manifest.input_root.join(&item.source_path),
    };
    let prompt = if step == StepKind::Describe {
        prompts.render(&manifest.describe.prompt, item)?
    } else {
        String::new()
    };

    Ok(StepRequest {
        item,
        input_path,
        output_dir: store.paths().item_artifacts_dir(&item.id),
        timeout: limits.step_timeout,
        output_limit_bytes: limits.output_limit_bytes,
        model: manifest.describe.model.clone(),
        prompt,
        canonical_format: limits.canonical_format.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{MediaKind, StepStatus};
    use crate::test_support::{
        ScriptedCollaborator, ScriptedStep, TestDirs, image_item, test_manifest, video_item,
    };

    fn limits() -> ExecutorLimits {
        ExecutorLimits {
            max_attempts: 2,
            step_timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            canonical_format: "png".to_string(),
        }
    }

    fn store_with(items: Vec<ItemRecord>) -> (TestDirs, Store) {
        let dirs = TestDirs::new().expect("dirs");
        let manifest = test_manifest("run-1", &dirs.input_dir, items);
        let store = Store::create(&dirs.run_dir, manifest).expect("create");
        (dirs, store)
    }

    #[test]
    fn image_item_completes_through_convert_and_describe() {
        let (_dirs, mut store) = store_with(vec![image_item("a", "a.jpg")]);
        let extract = ScriptedCollaborator::always_empty();
        let convert = ScriptedCollaborator::always_resolve("converted to png", "/tmp/a.png");
        let describe = ScriptedCollaborator::always_produce("a grey cat");
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        let state = process_item(&mut store, &bindings, &limits(), &StopFlag::new(), "a")
            .expect("process");
        assert_eq!(state, ItemState::Completed);
        assert_eq!(extract.calls(), 0);
        assert_eq!(convert.calls(), 1);
        assert_eq!(describe.calls(), 1);

        let item = store.get_item("a").expect("item");
        assert_eq!(item.status(StepKind::ExtractFrames), StepStatus::Skipped);
        assert_eq!(item.status(StepKind::Convert), StepStatus::Completed);
        assert_eq!(item.status(StepKind::Describe), StepStatus::Completed);
        assert_eq!(item.resolved_path.as_deref(), Some(std::path::Path::new("/tmp/a.png")));

        let describe_entry = item
            .results
            .iter()
            .find(|entry| entry.step == StepKind::Describe)
            .expect("describe entry");
        assert_eq!(describe_entry.payload, "a grey cat");
        assert_eq!(describe_entry.producer, "prov/model-a");
    }

    #[test]
    fn video_with_no_frames_skips_describe() {
        let (_dirs, mut store) = store_with(vec![video_item("v", "v.mp4")]);
        let extract = ScriptedCollaborator::always_empty();
        let convert = ScriptedCollaborator::always_produce("unused");
        let describe = ScriptedCollaborator::always_produce("unused");
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        let state = process_item(&mut store, &bindings, &limits(), &StopFlag::new(), "v")
            .expect("process");
        assert_eq!(state, ItemState::Completed);
        assert_eq!(describe.calls(), 0);

        let item = store.get_item("v").expect("item");
        assert_eq!(item.status(StepKind::ExtractFrames), StepStatus::Skipped);
        assert_eq!(item.status(StepKind::Convert), StepStatus::Skipped);
        assert_eq!(item.status(StepKind::Describe), StepStatus::Skipped);
    }

    #[test]
    fn failing_describe_retries_then_goes_terminal() {
        let (_dirs, mut store) = store_with(vec![image_item("a", "a.jpg")]);
        let extract = ScriptedCollaborator::always_empty();
        let convert = ScriptedCollaborator::always_resolve("converted", "/tmp/a.png");
        let describe = ScriptedCollaborator::always_fail("model unavailable");
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        let state = process_item(&mut store, &bindings, &limits(), &StopFlag::new(), "a")
            .expect("process");
        assert_eq!(state, ItemState::Failed);
        assert_eq!(describe.calls(), 2);

        let item = store.get_item("a").expect("item");
        assert_eq!(item.status(StepKind::Describe), StepStatus::Failed);
        assert_eq!(item.attempts_for(StepKind::Describe), 2);
        let error = item.last_error.as_ref().expect("last error");
        assert!(error.message.contains("model unavailable"));
    }

    #[test]
    fn transient_failure_recovers_on_retry() {
        let (_dirs, mut store) = store_with(vec![image_item("a", "a.jpg")]);
        let extract = ScriptedCollaborator::always_empty();
        let convert = ScriptedCollaborator::always_resolve("converted", "/tmp/a.png");
        let describe = ScriptedCollaborator::sequence(
            vec![ScriptedStep::Fail("timeout".to_string())],
            ScriptedStep::Produce {
                payload: "a cat".to_string(),
                resolved: None,
            },
        );
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        let state = process_item(&mut store, &bindings, &limits(), &StopFlag::new(), "a")
            .expect("process");
        assert_eq!(state, ItemState::Completed);
        assert_eq!(describe.calls(), 2);

        let item = store.get_item("a").expect("item");
        assert_eq!(item.status(StepKind::Describe), StepStatus::Completed);
        assert_eq!(item.attempts_for(StepKind::Describe), 1);
        assert!(item.last_error.is_none());
    }

    #[test]
    fn per_item_failure_does_not_stop_the_run() {
        let (_dirs, mut store) = store_with(vec![
            image_item("id-a", "a.jpg"),
            image_item("id-b", "b.jpg"),
        ]);
        let extract = ScriptedCollaborator::always_empty();
        // First item's convert fails both attempts; second item's succeeds.
        let convert = ScriptedCollaborator::sequence(
            vec![
                ScriptedStep::Fail("bad pixels".to_string()),
                ScriptedStep::Fail("bad pixels".to_string()),
            ],
            ScriptedStep::Produce {
                payload: "converted".to_string(),
                resolved: Some(PathBuf::from("/tmp/b.png")),
            },
        );
        let describe = ScriptedCollaborator::always_produce("fine");
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        let outcome = run_items(
            &mut store,
            &bindings,
            &limits(),
            &StopFlag::new(),
            |_, _| {},
        )
        .expect("run");

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.aborted);
    }

    #[test]
    fn stop_flag_aborts_between_items() {
        let (_dirs, mut store) = store_with(vec![
            image_item("id-a", "a.jpg"),
            image_item("id-b", "b.jpg"),
        ]);
        let stop = StopFlag::new();
        let extract = ScriptedCollaborator::always_empty();
        let convert = ScriptedCollaborator::always_resolve("converted", "/tmp/a.png");
        let describe = ScriptedCollaborator::always_produce("text");
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        let stop_after_first = stop.clone();
        let outcome = run_items(&mut store, &bindings, &limits(), &stop, move |_, _| {
            stop_after_first.trigger();
        })
        .expect("run");

        assert!(outcome.aborted);
        assert_eq!(outcome.processed, 1);
        // The second item was never started.
        let untouched = store.get_item("id-b").expect("item");
        assert!(untouched.steps.is_empty());
    }

    #[test]
    fn at_most_one_step_in_flight_is_preserved() {
        let (_dirs, mut store) = store_with(vec![image_item("a", "a.jpg")]);
        // Simulate an interrupted run: convert left in progress.
        store
            .commit_item_update("a", |record| {
                transitions::begin_step(record, StepKind::Convert).map_err(|e| anyhow!(e))
            })
            .expect("seed in-progress");

        let extract = ScriptedCollaborator::always_empty();
        let convert = ScriptedCollaborator::always_resolve("converted", "/tmp/a.png");
        let describe = ScriptedCollaborator::always_produce("text");
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        // Without resume reconciliation the executor must refuse to start a
        // second step while one is recorded in flight.
        let err = process_item(&mut store, &bindings, &limits(), &StopFlag::new(), "a")
            .unwrap_err();
        assert!(format!("{err:#}").contains("already in progress"));
    }

    #[test]
    fn unsupported_item_is_untouched_but_counted() {
        let record = ItemRecord::new(
            "u".to_string(),
            PathBuf::from("notes.txt"),
            MediaKind::Unsupported,
        );
        let (_dirs, mut store) = store_with(vec![record]);
        let extract = ScriptedCollaborator::always_empty();
        let convert = ScriptedCollaborator::always_produce("unused");
        let describe = ScriptedCollaborator::always_produce("unused");
        let bindings = StepBindings {
            extract: &extract,
            convert: &convert,
            describe: &describe,
        };

        let outcome = run_items(
            &mut store,
            &bindings,
            &limits(),
            &StopFlag::new(),
            |_, _| {},
        )
        .expect("run");
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.completed, 1);
        assert!(store.get_item("u").expect("item").steps.is_empty());
    }
}
