//! On-disk data model for a run: manifest, item records, result entries.
//!
//! These types define the stable contract between the executor, the resume
//! reconciliation, and external readers (monitor, stats). They are plain
//! serde structs; all mutation goes through [`crate::io::store::Store`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Media kind assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Unsupported,
}

/// Pipeline step identifiers.
///
/// `ExtractFrames`, `Convert`, and `Describe` are per-item steps tracked in
/// [`ItemRecord::steps`]; `Render` runs once per run over the full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ExtractFrames,
    Convert,
    Describe,
    Render,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::ExtractFrames => "extract_frames",
            StepKind::Convert => "convert",
            StepKind::Describe => "describe",
            StepKind::Render => "render",
        }
    }
}

/// Status of one step for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal statuses never change again within a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Overall run status recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

/// One durably recorded step result (e.g. a description text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub recorded_at: DateTime<Utc>,
    pub step: StepKind,
    /// Payload text (description, or a short producer note for file steps).
    pub payload: String,
    /// Identity of whatever produced this entry (e.g. `openai/gpt-4o`, `ffmpeg`).
    pub producer: String,
    pub duration_ms: u64,
}

/// Last error recorded for an item, kept for post-hoc diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Step that produced the error.
    pub step: StepKind,
    pub message: String,
}

/// One tracked media file and its progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Stable id derived from the normalized relative path.
    pub id: String,
    /// Path relative to the run's input root.
    pub source_path: PathBuf,
    pub kind: MediaKind,
    /// Current describable image for this item, once one exists.
    pub resolved_path: Option<PathBuf>,
    /// Per-step status; steps never planned for this item are absent.
    pub steps: BTreeMap<StepKind, StepStatus>,
    pub results: Vec<ResultEntry>,
    pub last_error: Option<ItemError>,
    /// Failed-execution counters per step.
    pub attempts: BTreeMap<StepKind, u32>,
}

impl ItemRecord {
    pub fn new(id: String, source_path: PathBuf, kind: MediaKind) -> Self {
        Self {
            id,
            source_path,
            kind,
            resolved_path: None,
            steps: BTreeMap::new(),
            results: Vec::new(),
            last_error: None,
            attempts: BTreeMap::new(),
        }
    }

    pub fn status(&self, step: StepKind) -> StepStatus {
        self.steps.get(&step).copied().unwrap_or(StepStatus::Pending)
    }

    pub fn attempts_for(&self, step: StepKind) -> u32 {
        self.attempts.get(&step).copied().unwrap_or(0)
    }

    /// The step currently `in_progress`, if any.
    pub fn in_flight(&self) -> Option<StepKind> {
        self.steps
            .iter()
            .find(|(_, status)| **status == StepStatus::InProgress)
            .map(|(step, _)| *step)
    }

    /// An item is settled when every planned step reached a terminal status.
    ///
    /// Supported items settle only once `describe` itself is terminal; an
    /// empty status map means the item has not been touched yet.
    pub fn is_settled(&self) -> bool {
        match self.kind {
            MediaKind::Unsupported => true,
            MediaKind::Image | MediaKind::Video => {
                self.steps.contains_key(&StepKind::Describe)
                    && self.steps.values().all(|status| status.is_terminal())
            }
        }
    }

    /// True when some step is terminally `failed`.
    pub fn has_failed_step(&self) -> bool {
        self.steps.values().any(|s| *s == StepStatus::Failed)
    }
}

/// Describe-step configuration carried in the manifest so that resumed runs
/// can detect producer changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeProfile {
    pub provider: String,
    pub model: String,
    pub prompt: String,
}

impl DescribeProfile {
    /// Producer identity stamped on describe result entries.
    pub fn producer(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// The whole persisted state of one run: header plus all item records.
///
/// Stored as a single `manifest.json` document so that one atomic rename
/// publishes a consistent view of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub input_root: PathBuf,
    /// Ordered steps this run executes.
    pub steps: Vec<StepKind>,
    pub describe: DescribeProfile,
    pub status: RunStatus,
    /// Item records keyed by item id; BTreeMap keeps serialization stable.
    pub items: BTreeMap<String, ItemRecord>,
}

impl RunManifest {
    pub fn new(
        run_id: String,
        input_root: PathBuf,
        describe: DescribeProfile,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            created_at,
            input_root,
            steps: vec![
                StepKind::ExtractFrames,
                StepKind::Convert,
                StepKind::Describe,
                StepKind::Render,
            ],
            describe,
            status: RunStatus::Running,
            items: BTreeMap::new(),
        }
    }

    /// Items fully settled with no failed step.
    pub fn completed_count(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.is_settled() && !item.has_failed_step())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.has_failed_step())
            .count()
    }

    /// Item ids in processing order (sorted by normalized source path, then id).
    pub fn ordered_item_ids(&self) -> Vec<String> {
        let mut ids: Vec<(String, String)> = self
            .items
            .values()
            .map(|item| {
                (
                    item.source_path.to_string_lossy().replace('\\', "/"),
                    item.id.clone(),
                )
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, kind: MediaKind) -> ItemRecord {
        ItemRecord::new(id.to_string(), PathBuf::from(format!("{id}.jpg")), kind)
    }

    #[test]
    fn step_kind_serializes_snake_case() {
        let json = serde_json::to_string(&StepKind::ExtractFrames).expect("serialize");
        assert_eq!(json, "\"extract_frames\"");
    }

    #[test]
    fn missing_step_defaults_to_pending() {
        let record = item("a", MediaKind::Image);
        assert_eq!(record.status(StepKind::Describe), StepStatus::Pending);
        assert_eq!(record.attempts_for(StepKind::Describe), 0);
    }

    #[test]
    fn in_flight_finds_the_in_progress_step() {
        let mut record = item("a", MediaKind::Image);
        record.steps.insert(StepKind::Convert, StepStatus::Completed);
        record
            .steps
            .insert(StepKind::Describe, StepStatus::InProgress);
        assert_eq!(record.in_flight(), Some(StepKind::Describe));
    }

    #[test]
    fn completed_count_ignores_failed_and_unsettled_items() {
        let profile = DescribeProfile {
            provider: "prov".to_string(),
            model: "model".to_string(),
            prompt: "p".to_string(),
        };
        let mut manifest = RunManifest::new(
            "run-1".to_string(),
            PathBuf::from("/in"),
            profile,
            Utc::now(),
        );

        let mut done = item("done", MediaKind::Image);
        done.steps.insert(StepKind::Describe, StepStatus::Completed);

        let mut failed = item("failed", MediaKind::Image);
        failed.steps.insert(StepKind::Describe, StepStatus::Failed);

        let mut open = item("open", MediaKind::Image);
        open.steps.insert(StepKind::Describe, StepStatus::Pending);

        for record in [done, failed, open] {
            manifest.items.insert(record.id.clone(), record);
        }

        assert_eq!(manifest.completed_count(), 1);
        assert_eq!(manifest.failed_count(), 1);
    }

    #[test]
    fn ordered_item_ids_sort_by_source_path() {
        let profile = DescribeProfile {
            provider: "prov".to_string(),
            model: "model".to_string(),
            prompt: "p".to_string(),
        };
        let mut manifest = RunManifest::new(
            "run-1".to_string(),
            PathBuf::from("/in"),
            profile,
            Utc::now(),
        );
        let mut b = item("id-b", MediaKind::Image);
        b.source_path = PathBuf::from("b/two.jpg");
        let mut a = item("id-a", MediaKind::Image);
        a.source_path = PathBuf::from("a/one.jpg");
        manifest.items.insert(b.id.clone(), b);
        manifest.items.insert(a.id.clone(), a);

        assert_eq!(manifest.ordered_item_ids(), vec!["id-a", "id-b"]);
    }
}
