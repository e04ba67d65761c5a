//! Input root scanning.
//!
//! Produces a deterministic, sorted listing of candidate files. Unreadable
//! entries are collected as warnings and never abort the scan.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A non-fatal problem encountered while scanning.
#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: Option<PathBuf>,
    pub message: String,
}

/// Result of scanning an input root.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Regular-file paths relative to the root, sorted by normalized path.
    pub files: Vec<PathBuf>,
    pub warnings: Vec<ScanWarning>,
}

/// Scan `root` for regular files.
///
/// With `recursive` false only the top level is listed. The returned order
/// is stable across runs over identical filesystem contents.
pub fn scan_input_root(root: &Path, recursive: bool) -> Result<ScanOutcome> {
    if !root.is_dir() {
        return Err(anyhow!("input root {} is not a directory", root.display()));
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("canonicalize {}", root.display()))?;

    let mut walker = WalkDir::new(&root).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    let mut warnings = Vec::new();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf);
                warn!(path = ?path, error = %err, "unreadable entry skipped");
                warnings.push(ScanWarning {
                    path,
                    message: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.path().strip_prefix(&root) {
            Ok(relative) => files.push(relative.to_path_buf()),
            Err(err) => warnings.push(ScanWarning {
                path: Some(entry.path().to_path_buf()),
                message: format!("not under input root: {err}"),
            }),
        }
    }

    files.sort_by_key(|path| crate::core::classify::normalize(path));
    debug!(
        files = files.len(),
        warnings = warnings.len(),
        "input root scanned"
    );
    Ok(ScanOutcome { files, warnings })
}
