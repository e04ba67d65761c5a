//! Shared application state for the monitor server.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

/// Events broadcast to SSE clients when run files change.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// The manifest was republished by the writer.
    ManifestChanged,
    ConfigChanged,
    ReportChanged,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Run directory being monitored (contains manifest.json).
    pub run_dir: PathBuf,
    /// Broadcast sender for file change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(run_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            run_dir,
            event_tx: Arc::new(event_tx),
        }
    }

    /// Path to manifest.json.
    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join("manifest.json")
    }

    /// Path to config.toml.
    pub fn config_path(&self) -> PathBuf {
        self.run_dir.join("config.toml")
    }

    /// Path to report.html.
    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join("report.html")
    }
}
