//! HTML report rendering over a run snapshot.
//!
//! Pure formatting: the same snapshot always renders the same report, so
//! re-running the render step after a crash or resume is harmless.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::stats::RunStats;
use crate::manifest::{ItemRecord, RunManifest, StepKind};

const REPORT_TEMPLATE: &str = include_str!("templates/report.html");

#[derive(Debug, Serialize)]
struct DescriptionRow {
    producer: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct ItemRow {
    source: String,
    kind: String,
    state: String,
    error: Option<String>,
    descriptions: Vec<DescriptionRow>,
}

impl ItemRow {
    fn from_record(item: &ItemRecord) -> Self {
        let state = if item.has_failed_step() {
            "failed"
        } else if item.is_settled() {
            "completed"
        } else {
            "open"
        };
        Self {
            source: item.source_path.to_string_lossy().into_owned(),
            kind: match serde_json::to_value(item.kind) {
                Ok(serde_json::Value::String(kind)) => kind,
                _ => "unknown".to_string(),
            },
            state: state.to_string(),
            error: item.last_error.as_ref().map(|e| e.message.clone()),
            descriptions: item
                .results
                .iter()
                .filter(|entry| entry.step == StepKind::Describe)
                .map(|entry| DescriptionRow {
                    producer: entry.producer.clone(),
                    text: entry.payload.clone(),
                })
                .collect(),
        }
    }
}

/// Render the report for `manifest` and write it to `path`.
pub fn write_report(path: &Path, manifest: &RunManifest, stats: &RunStats) -> Result<()> {
    let mut env = Environment::new();
    env.add_template("report", REPORT_TEMPLATE)
        .expect("report template should be valid");
    let template = env.get_template("report")?;

    let items: Vec<ItemRow> = manifest
        .ordered_item_ids()
        .iter()
        .filter_map(|id| manifest.items.get(id))
        .map(ItemRow::from_record)
        .collect();

    let rendered = template.render(context! {
        stats => stats,
        status => format!("{:?}", manifest.status).to_lowercase(),
        items => items,
    })?;

    fs::write(path, rendered).with_context(|| format!("write report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stats::aggregate;
    use crate::manifest::{DescribeProfile, MediaKind, ResultEntry, StepStatus};
    use chrono::Utc;
    use std::path::PathBuf;

    #[test]
    fn report_lists_descriptions_per_producer() {
        let mut manifest = RunManifest::new(
            "run-1".to_string(),
            PathBuf::from("/in"),
            DescribeProfile {
                provider: "prov".to_string(),
                model: "model-a".to_string(),
                prompt: "p".to_string(),
            },
            Utc::now(),
        );
        let mut item = ItemRecord::new("a".to_string(), "cat.png".into(), MediaKind::Image);
        item.resolved_path = Some("cat.png".into());
        item.steps.insert(StepKind::Describe, StepStatus::Completed);
        for (producer, text) in [("prov/model-a", "a grey cat"), ("prov/model-b", "a cat")] {
            item.results.push(ResultEntry {
                recorded_at: Utc::now(),
                step: StepKind::Describe,
                payload: text.to_string(),
                producer: producer.to_string(),
                duration_ms: 10,
            });
        }
        manifest.items.insert("a".to_string(), item);

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("report.html");
        let stats = aggregate(&manifest, Utc::now());
        write_report(&path, &manifest, &stats).expect("render");

        let html = fs::read_to_string(&path).expect("read");
        assert!(html.contains("cat.png"));
        assert!(html.contains("a grey cat"));
        assert!(html.contains("prov/model-b"));
        assert!(html.contains("1 completed"));
    }

    #[test]
    fn rendering_twice_is_identical() {
        let manifest = RunManifest::new(
            "run-1".to_string(),
            PathBuf::from("/in"),
            DescribeProfile {
                provider: "prov".to_string(),
                model: "model".to_string(),
                prompt: "p".to_string(),
            },
            Utc::now(),
        );
        let stats = aggregate(&manifest, manifest.created_at);

        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("a.html");
        let second = temp.path().join("b.html");
        write_report(&first, &manifest, &stats).expect("first");
        write_report(&second, &manifest, &stats).expect("second");

        assert_eq!(
            fs::read(&first).expect("read a"),
            fs::read(&second).expect("read b")
        );
    }
}
