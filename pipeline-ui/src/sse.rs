//! Server-Sent Events stream and run-directory file watcher.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct SsePayload {
    #[serde(rename = "type")]
    event_type: String,
}

impl From<&ChangeEvent> for SsePayload {
    fn from(event: &ChangeEvent) -> Self {
        let event_type = match event {
            ChangeEvent::ManifestChanged => "manifest_changed",
            ChangeEvent::ConfigChanged => "config_changed",
            ChangeEvent::ReportChanged => "report_changed",
        };
        SsePayload {
            event_type: event_type.to_string(),
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        // Send initial connected event
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(&change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let tx_clone = tx.clone();
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx_clone.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    // Watch the run directory itself; artifacts/ churn is irrelevant to the
    // snapshot view, so recursion stays off.
    if state.run_dir.exists() {
        watcher.watch(&state.run_dir, RecursiveMode::NonRecursive)?;
        info!(path = %state.run_dir.display(), "watching run directory");
    }

    // Process in batches at a fixed interval so a writer committing every
    // item does not produce an event flood.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &pending_events);
                pending_events.clear();
            }
        }
    }
}

fn process_events(state: &AppState, events: &[NotifyEvent]) {
    let mut manifest_changed = false;
    let mut config_changed = false;
    let mut report_changed = false;

    let manifest_path = state.manifest_path();
    let config_path = state.config_path();
    let report_path = state.report_path();

    for event in events {
        // Only care about create/modify events
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }

        for path in &event.paths {
            if path == &manifest_path {
                manifest_changed = true;
            } else if path == &config_path {
                config_changed = true;
            } else if path == &report_path {
                report_changed = true;
            }
        }
    }

    if manifest_changed {
        debug!("broadcasting manifest change");
        let _ = state.event_tx.send(ChangeEvent::ManifestChanged);
    }
    if config_changed {
        debug!("broadcasting config change");
        let _ = state.event_tx.send(ChangeEvent::ConfigChanged);
    }
    if report_changed {
        debug!("broadcasting report change");
        let _ = state.event_tx.send(ChangeEvent::ReportChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modify_event(path: std::path::PathBuf) -> NotifyEvent {
        NotifyEvent {
            kind: EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    #[test]
    fn manifest_write_broadcasts_a_single_event() {
        let run_dir = std::env::temp_dir()
            .join("pipeline-ui-tests")
            .join(format!("pid-{}", std::process::id()));
        let state = AppState::new(run_dir);
        let mut rx = state.event_tx.subscribe();

        // Two batched writes to the manifest coalesce into one broadcast.
        process_events(
            &state,
            &[
                modify_event(state.manifest_path()),
                modify_event(state.manifest_path()),
            ],
        );

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChangeEvent::ManifestChanged));
    }

    #[test]
    fn unrelated_and_temp_files_are_ignored() {
        let run_dir = std::env::temp_dir()
            .join("pipeline-ui-tests")
            .join(format!("pid-{}", std::process::id()));
        let state = AppState::new(run_dir.clone());
        let mut rx = state.event_tx.subscribe();

        process_events(
            &state,
            &[
                modify_event(run_dir.join("manifest.json.tmp")),
                modify_event(run_dir.join("run.lock")),
            ],
        );

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn report_and_config_events_are_distinct() {
        let run_dir = std::env::temp_dir()
            .join("pipeline-ui-tests")
            .join(format!("pid-{}", std::process::id()));
        let state = AppState::new(run_dir);
        let mut rx = state.event_tx.subscribe();

        process_events(
            &state,
            &[
                modify_event(state.config_path()),
                modify_event(state.report_path()),
            ],
        );

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChangeEvent::ConfigChanged));
        assert!(matches!(events[1], ChangeEvent::ReportChanged));
    }
}
