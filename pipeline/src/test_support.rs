//! Test-only helpers: deterministic records, temp run directories, and
//! scripted collaborators that never spawn processes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use chrono::Utc;

use crate::io::collaborator::{Collaborator, StepOutput, StepRequest};
use crate::manifest::{DescribeProfile, ItemRecord, MediaKind, RunManifest};

/// Create an image item record with deterministic fields.
pub fn image_item(id: &str, source: &str) -> ItemRecord {
    ItemRecord::new(id.to_string(), PathBuf::from(source), MediaKind::Image)
}

/// Create a video item record with deterministic fields.
pub fn video_item(id: &str, source: &str) -> ItemRecord {
    ItemRecord::new(id.to_string(), PathBuf::from(source), MediaKind::Video)
}

/// Default describe profile used across tests.
pub fn test_profile() -> DescribeProfile {
    DescribeProfile {
        provider: "prov".to_string(),
        model: "model-a".to_string(),
        prompt: "Describe this image.".to_string(),
    }
}

/// Build a manifest holding `items`, keyed by their ids.
pub fn test_manifest(run_id: &str, input_root: &std::path::Path, items: Vec<ItemRecord>) -> RunManifest {
    let mut manifest = RunManifest::new(
        run_id.to_string(),
        input_root.to_path_buf(),
        test_profile(),
        Utc::now(),
    );
    for item in items {
        manifest.items.insert(item.id.clone(), item);
    }
    manifest
}

/// Temp directories for one test run: an input root and a run directory.
pub struct TestDirs {
    _temp: tempfile::TempDir,
    pub input_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<TestDirs> {
        let temp = tempfile::tempdir()?;
        let input_dir = temp.path().join("input");
        let run_dir = temp.path().join("run");
        std::fs::create_dir_all(&input_dir)?;
        Ok(TestDirs {
            _temp: temp,
            input_dir,
            run_dir,
        })
    }

    /// Seed empty files under the input root.
    pub fn seed_files(&self, names: &[&str]) -> Result<()> {
        for name in names {
            let path = self.input_dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, b"media bytes")?;
        }
        Ok(())
    }
}

/// One scripted collaborator response.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Produce {
        payload: String,
        resolved: Option<PathBuf>,
    },
    Empty,
    Fail(String),
}

/// Collaborator returning scripted responses in order; once the script is
/// exhausted it keeps returning the fallback.
pub struct ScriptedCollaborator {
    script: Mutex<VecDeque<ScriptedStep>>,
    fallback: ScriptedStep,
    calls: AtomicUsize,
}

impl ScriptedCollaborator {
    pub fn sequence(steps: Vec<ScriptedStep>, fallback: ScriptedStep) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always succeed with `payload` and no resolved path.
    pub fn always_produce(payload: &str) -> Self {
        Self::sequence(
            Vec::new(),
            ScriptedStep::Produce {
                payload: payload.to_string(),
                resolved: None,
            },
        )
    }

    /// Always succeed with `payload`, resolving to `resolved`.
    pub fn always_resolve(payload: &str, resolved: &str) -> Self {
        Self::sequence(
            Vec::new(),
            ScriptedStep::Produce {
                payload: payload.to_string(),
                resolved: Some(PathBuf::from(resolved)),
            },
        )
    }

    /// Always fail with `message`.
    pub fn always_fail(message: &str) -> Self {
        Self::sequence(Vec::new(), ScriptedStep::Fail(message.to_string()))
    }

    /// Always report zero usable output.
    pub fn always_empty() -> Self {
        Self::sequence(Vec::new(), ScriptedStep::Empty)
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Collaborator for ScriptedCollaborator {
    fn run(&self, _request: &StepRequest<'_>) -> Result<StepOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock().expect("script lock");
            script.pop_front().unwrap_or_else(|| self.fallback.clone())
        };
        match step {
            ScriptedStep::Produce { payload, resolved } => {
                Ok(StepOutput::Produced { payload, resolved })
            }
            ScriptedStep::Empty => Ok(StepOutput::Empty {
                note: "scripted empty".to_string(),
            }),
            ScriptedStep::Fail(message) => Err(anyhow!(message)),
        }
    }
}
