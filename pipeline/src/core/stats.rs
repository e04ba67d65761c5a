//! Aggregate timing and progress statistics over a manifest snapshot.
//!
//! Pure: safe to run against a read-mode store at any time, including while
//! the writer is mid-run.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::manifest::{RunManifest, RunStatus, StepStatus};

/// Per-step status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepTally {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Per-producer-identity aggregates, keyed by [`crate::manifest::ResultEntry::producer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProducerStats {
    pub entries: usize,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
}

/// A terminally failed item with its last recorded error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub source_path: String,
    pub step: Option<String>,
    pub message: Option<String>,
}

/// One recent result entry, newest first, for live progress views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentEntry {
    pub recorded_at: DateTime<Utc>,
    pub source_path: String,
    pub step: String,
    pub producer: String,
    pub payload: String,
}

/// How many recent entries a snapshot aggregate keeps.
const RECENT_ENTRIES: usize = 10;

/// Derived statistics for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub run_id: String,
    pub status: RunStatus,
    pub total_items: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub completed_items: usize,
    pub failed_items: usize,
    pub open_items: usize,
    pub steps: BTreeMap<String, StepTally>,
    pub producers: BTreeMap<String, ProducerStats>,
    pub result_entries: usize,
    pub elapsed_secs: f64,
    /// Completed items per second since run creation, once any completed.
    pub throughput_per_sec: Option<f64>,
    /// Seconds to finish the open items at the observed throughput.
    pub eta_secs: Option<f64>,
    pub recent: Vec<RecentEntry>,
    pub failed: Vec<FailedItem>,
}

/// Aggregate a snapshot into [`RunStats`].
pub fn aggregate(manifest: &RunManifest, now: DateTime<Utc>) -> RunStats {
    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    let mut steps: BTreeMap<String, StepTally> = BTreeMap::new();
    let mut producers: BTreeMap<String, ProducerStats> = BTreeMap::new();
    let mut result_entries = 0usize;
    let mut failed = Vec::new();
    let mut recent: Vec<RecentEntry> = Vec::new();

    for item in manifest.items.values() {
        let kind = match serde_json::to_value(item.kind) {
            Ok(serde_json::Value::String(kind)) => kind,
            _ => "unknown".to_string(),
        };
        *by_kind.entry(kind).or_insert(0) += 1;

        for (step, status) in &item.steps {
            let tally = steps.entry(step.as_str().to_string()).or_default();
            match status {
                StepStatus::Pending => tally.pending += 1,
                StepStatus::InProgress => tally.in_progress += 1,
                StepStatus::Completed => tally.completed += 1,
                StepStatus::Failed => tally.failed += 1,
                StepStatus::Skipped => tally.skipped += 1,
            }
        }

        for entry in &item.results {
            result_entries += 1;
            let stats = producers.entry(entry.producer.clone()).or_default();
            stats.entries += 1;
            stats.total_duration_ms += entry.duration_ms;
            recent.push(RecentEntry {
                recorded_at: entry.recorded_at,
                source_path: item.source_path.to_string_lossy().into_owned(),
                step: entry.step.as_str().to_string(),
                producer: entry.producer.clone(),
                payload: entry.payload.clone(),
            });
        }

        if item.has_failed_step() {
            failed.push(FailedItem {
                id: item.id.clone(),
                source_path: item.source_path.to_string_lossy().into_owned(),
                step: item.last_error.as_ref().map(|e| e.step.as_str().to_string()),
                message: item.last_error.as_ref().map(|e| e.message.clone()),
            });
        }
    }

    for stats in producers.values_mut() {
        stats.avg_duration_ms = stats.total_duration_ms as f64 / stats.entries as f64;
    }
    failed.sort_by(|a, b| a.source_path.cmp(&b.source_path));
    recent.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
    recent.truncate(RECENT_ENTRIES);

    let completed_items = manifest.completed_count();
    let failed_items = manifest.failed_count();
    let elapsed = (now - manifest.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    let throughput_per_sec = (completed_items > 0 && elapsed > 0.0)
        .then(|| completed_items as f64 / elapsed);
    let open_items = manifest
        .items
        .len()
        .saturating_sub(completed_items + failed_items);
    let eta_secs = match throughput_per_sec {
        Some(throughput) if open_items > 0 => Some(open_items as f64 / throughput),
        _ => None,
    };

    RunStats {
        run_id: manifest.run_id.clone(),
        status: manifest.status,
        total_items: manifest.items.len(),
        by_kind,
        completed_items,
        failed_items,
        open_items,
        steps,
        producers,
        result_entries,
        elapsed_secs: elapsed,
        throughput_per_sec,
        eta_secs,
        recent,
        failed,
    }
}

/// Plain-text rendering for `pipeline stats` / `pipeline status`.
pub fn render_text(stats: &RunStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run {} ({:?})", stats.run_id, stats.status);
    let _ = writeln!(
        out,
        "items: {} total, {} completed, {} failed, {} open",
        stats.total_items, stats.completed_items, stats.failed_items, stats.open_items
    );
    for (kind, count) in &stats.by_kind {
        let _ = writeln!(out, "  {kind}: {count}");
    }
    let _ = writeln!(out, "steps:");
    for (step, tally) in &stats.steps {
        let _ = writeln!(
            out,
            "  {step}: {} completed, {} failed, {} skipped, {} pending, {} in progress",
            tally.completed, tally.failed, tally.skipped, tally.pending, tally.in_progress
        );
    }
    if !stats.producers.is_empty() {
        let _ = writeln!(out, "producers:");
        for (producer, p) in &stats.producers {
            let _ = writeln!(
                out,
                "  {producer}: {} entries, avg {:.0} ms",
                p.entries, p.avg_duration_ms
            );
        }
    }
    if let Some(throughput) = stats.throughput_per_sec {
        let _ = writeln!(
            out,
            "throughput: {throughput:.3} items/sec over {:.1}s",
            stats.elapsed_secs
        );
    }
    if let Some(eta) = stats.eta_secs {
        let _ = writeln!(out, "estimated completion in {eta:.0}s");
    }
    for failure in &stats.failed {
        let _ = writeln!(
            out,
            "failed: {} ({}: {})",
            failure.source_path,
            failure.step.as_deref().unwrap_or("?"),
            failure.message.as_deref().unwrap_or("no error recorded")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DescribeProfile, ItemRecord, MediaKind, ResultEntry, StepKind};
    use chrono::Duration;
    use std::path::PathBuf;

    fn manifest() -> RunManifest {
        RunManifest::new(
            "run-1".to_string(),
            PathBuf::from("/in"),
            DescribeProfile {
                provider: "prov".to_string(),
                model: "model-a".to_string(),
                prompt: "p".to_string(),
            },
            Utc::now(),
        )
    }

    fn entry(producer: &str, duration_ms: u64) -> ResultEntry {
        ResultEntry {
            recorded_at: Utc::now(),
            step: StepKind::Describe,
            payload: "text".to_string(),
            producer: producer.to_string(),
            duration_ms,
        }
    }

    #[test]
    fn aggregates_producers_separately() {
        let mut m = manifest();
        let mut item = ItemRecord::new("a".to_string(), "a.png".into(), MediaKind::Image);
        item.resolved_path = Some("a.png".into());
        item.steps.insert(StepKind::Describe, StepStatus::Completed);
        item.results.push(entry("prov/model-a", 100));
        item.results.push(entry("prov/model-b", 300));
        m.items.insert("a".to_string(), item);

        let stats = aggregate(&m, Utc::now());
        assert_eq!(stats.result_entries, 2);
        assert_eq!(stats.producers.len(), 2);
        assert_eq!(stats.producers["prov/model-a"].entries, 1);
        assert_eq!(stats.producers["prov/model-b"].avg_duration_ms, 300.0);
    }

    #[test]
    fn computes_throughput_from_created_at() {
        let mut m = manifest();
        m.created_at = Utc::now() - Duration::seconds(10);
        let mut item = ItemRecord::new("a".to_string(), "a.png".into(), MediaKind::Image);
        item.resolved_path = Some("a.png".into());
        item.steps.insert(StepKind::Describe, StepStatus::Completed);
        item.results.push(entry("prov/model-a", 10));
        m.items.insert("a".to_string(), item);

        let stats = aggregate(&m, Utc::now());
        assert_eq!(stats.completed_items, 1);
        let throughput = stats.throughput_per_sec.expect("throughput");
        assert!(throughput > 0.05 && throughput < 0.2, "got {throughput}");
    }

    #[test]
    fn recent_entries_are_newest_first_and_bounded() {
        let mut m = manifest();
        let mut item = ItemRecord::new("a".to_string(), "a.png".into(), MediaKind::Image);
        item.resolved_path = Some("a.png".into());
        item.steps.insert(StepKind::Describe, StepStatus::Completed);
        for n in 0..15 {
            let mut e = entry("prov/model-a", 10);
            e.recorded_at = Utc::now() - Duration::seconds(15 - n);
            e.payload = format!("entry {n}");
            item.results.push(e);
        }
        m.items.insert("a".to_string(), item);

        let stats = aggregate(&m, Utc::now());
        assert_eq!(stats.recent.len(), 10);
        assert_eq!(stats.recent[0].payload, "entry 14");
        assert!(stats.recent[0].recorded_at >= stats.recent[9].recorded_at);
    }

    #[test]
    fn eta_requires_open_items_and_throughput() {
        let mut m = manifest();
        m.created_at = Utc::now() - Duration::seconds(10);
        let mut done = ItemRecord::new("a".to_string(), "a.png".into(), MediaKind::Image);
        done.resolved_path = Some("a.png".into());
        done.steps.insert(StepKind::Describe, StepStatus::Completed);
        done.results.push(entry("prov/model-a", 10));
        let open = ItemRecord::new("b".to_string(), "b.png".into(), MediaKind::Image);
        m.items.insert("a".to_string(), done);
        m.items.insert("b".to_string(), open);

        let stats = aggregate(&m, Utc::now());
        let eta = stats.eta_secs.expect("eta");
        assert!(eta > 5.0 && eta < 20.0, "got {eta}");

        // A fully settled run has no ETA.
        let mut settled = m.clone();
        settled
            .items
            .get_mut("b")
            .expect("item")
            .steps
            .insert(StepKind::Describe, StepStatus::Skipped);
        let stats = aggregate(&settled, Utc::now());
        assert!(stats.eta_secs.is_none());
    }

    #[test]
    fn failed_items_carry_their_last_error() {
        let mut m = manifest();
        let mut item = ItemRecord::new("a".to_string(), "a.jpg".into(), MediaKind::Image);
        item.steps.insert(StepKind::Convert, StepStatus::Failed);
        item.last_error = Some(crate::manifest::ItemError {
            step: StepKind::Convert,
            message: "exit status 1".to_string(),
        });
        m.items.insert("a".to_string(), item);

        let stats = aggregate(&m, Utc::now());
        assert_eq!(stats.failed_items, 1);
        assert_eq!(stats.failed[0].step.as_deref(), Some("convert"));

        let text = render_text(&stats);
        assert!(text.contains("exit status 1"));
    }
}
