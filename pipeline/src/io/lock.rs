//! Advisory writer lock for a run directory.
//!
//! `run.lock` holds the writer's pid and timestamps. Exactly one live writer
//! may hold it; read-mode opens never touch it. A lock whose `refreshed_at`
//! is older than the grace period is considered left behind by a crashed
//! writer and reclaimed. The owning store refreshes the lock on every
//! commit, so a slow-but-alive writer is never reclaimed from.

use std::fmt;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default grace period before a writer lock may be reclaimed.
pub const DEFAULT_LOCK_GRACE: Duration = Duration::from_secs(15 * 60);

/// Contents of `run.lock`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

/// Another live writer already holds the run.
#[derive(Debug, Clone)]
pub struct LockHeldError {
    pub pid: u32,
    pub refreshed_at: DateTime<Utc>,
}

impl fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run is locked by pid {} (last refreshed {})",
            self.pid, self.refreshed_at
        )
    }
}

impl std::error::Error for LockHeldError {}

/// Held writer lock. Best-effort released on drop.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl WriterLock {
    /// Acquire the writer lock, reclaiming a stale one.
    pub fn acquire(path: &Path, grace: Duration) -> Result<WriterLock> {
        let pid = std::process::id();
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let now = Utc::now();
                let info = LockInfo {
                    pid,
                    acquired_at: now,
                    refreshed_at: now,
                };
                write_info(&mut file, &info)
                    .with_context(|| format!("write lock {}", path.display()))?;
                debug!(pid, path = %path.display(), "writer lock acquired");
                Ok(WriterLock {
                    path: path.to_path_buf(),
                    pid,
                    acquired_at: now,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_info(path)?;
                let age = Utc::now() - holder.refreshed_at;
                if age.to_std().unwrap_or(Duration::ZERO) < grace {
                    return Err(LockHeldError {
                        pid: holder.pid,
                        refreshed_at: holder.refreshed_at,
                    }
                    .into());
                }
                info!(
                    stale_pid = holder.pid,
                    age_secs = age.num_seconds(),
                    "reclaiming stale writer lock"
                );
                fs::remove_file(path)
                    .with_context(|| format!("remove stale lock {}", path.display()))?;
                Self::acquire(path, grace)
            }
            Err(err) => {
                Err(err).with_context(|| format!("create lock {}", path.display()))
            }
        }
    }

    /// Re-stamp `refreshed_at`; called by the store after each commit.
    pub fn refresh(&self) -> Result<()> {
        let info = LockInfo {
            pid: self.pid,
            acquired_at: self.acquired_at,
            refreshed_at: Utc::now(),
        };
        let mut file = fs::File::create(&self.path)
            .with_context(|| format!("rewrite lock {}", self.path.display()))?;
        write_info(&mut file, &info)
            .with_context(|| format!("refresh lock {}", self.path.display()))
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release writer lock");
        }
    }
}

fn write_info(file: &mut fs::File, info: &LockInfo) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(info)?;
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_info(path: &Path) -> Result<LockInfo> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read lock {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse lock {}", path.display()))
}
