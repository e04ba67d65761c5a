//! Durable, crash-safe run state store.
//!
//! One writer process owns a run directory (enforced by [`WriterLock`]);
//! any number of readers may open the same directory concurrently. All
//! mutation funnels through the commit path, which publishes each update as
//! a full, atomically renamed document: readers only ever open the canonical
//! rename-target path, so they see the previous or the new document, never
//! a mix.

use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::invariants::validate_invariants;
use crate::io::lock::{DEFAULT_LOCK_GRACE, WriterLock};
use crate::io::paths::RunPaths;
use crate::manifest::{ItemRecord, RunManifest};

const MANIFEST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/manifest/v1.schema.json"
));

/// How a store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Shared, lock-free; snapshots re-read the canonical document.
    Read,
    /// Exclusive; takes the writer lock and caches the manifest in memory.
    Write,
}

/// Both the canonical manifest and its backup failed to load. The run state
/// cannot be trusted; the engine refuses to start empty over it.
#[derive(Debug)]
pub struct UnrecoverableStoreError {
    pub canonical_error: String,
    pub backup_error: String,
}

impl fmt::Display for UnrecoverableStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run state is unrecoverable: manifest failed ({}); backup failed ({})",
            self.canonical_error, self.backup_error
        )
    }
}

impl std::error::Error for UnrecoverableStoreError {}

/// Handle on a run directory's persisted state.
#[derive(Debug)]
pub struct Store {
    paths: RunPaths,
    mode: OpenMode,
    manifest: RunManifest,
    lock: Option<WriterLock>,
}

impl Store {
    /// Create a fresh run: takes the writer lock and persists the initial
    /// manifest. Fails if the directory already holds one.
    pub fn create(run_dir: &Path, manifest: RunManifest) -> Result<Store> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("create run directory {}", run_dir.display()))?;
        let paths = RunPaths::new(run_dir);
        if paths.manifest_path.exists() {
            return Err(anyhow!(
                "{} already contains a run (resume it instead)",
                run_dir.display()
            ));
        }
        let lock = WriterLock::acquire(&paths.lock_path, DEFAULT_LOCK_GRACE)?;
        persist(&paths, &manifest)?;
        info!(run_id = %manifest.run_id, run_dir = %run_dir.display(), "run created");
        Ok(Store {
            paths,
            mode: OpenMode::Write,
            manifest,
            lock: Some(lock),
        })
    }

    /// Open an existing run directory.
    ///
    /// Write mode fails fast with [`crate::io::lock::LockHeldError`] when a
    /// live writer holds the run. A corrupt canonical manifest falls back to
    /// the backup; write mode then restores the canonical file from it.
    pub fn open(run_dir: &Path, mode: OpenMode) -> Result<Store> {
        let paths = RunPaths::new(run_dir);
        if !run_dir.is_dir() {
            return Err(anyhow!("{} is not a run directory", run_dir.display()));
        }
        let lock = match mode {
            OpenMode::Write => Some(WriterLock::acquire(&paths.lock_path, DEFAULT_LOCK_GRACE)?),
            OpenMode::Read => None,
        };
        let manifest = load_with_recovery(&paths, mode)?;
        debug!(run_id = %manifest.run_id, ?mode, "store opened");
        Ok(Store {
            paths,
            mode,
            manifest,
            lock,
        })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// The last durably committed manifest (write mode: in-memory cache,
    /// always equal to the canonical file).
    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    /// Last durably committed record for one item.
    pub fn get_item(&self, id: &str) -> Option<&ItemRecord> {
        self.manifest.items.get(id)
    }

    /// The single authoritative write path for item state.
    ///
    /// Applies `mutator` to a copy, checks invariants, and durably publishes
    /// the whole document. A mutator error leaves memory and disk untouched.
    pub fn commit_item_update<F>(&mut self, id: &str, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut ItemRecord) -> Result<()>,
    {
        self.ensure_write()?;
        let mut next = self.manifest.clone();
        let item = next
            .items
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown item '{id}'"))?;
        mutator(item)?;
        self.commit(next)
    }

    /// Commit a run-level mutation (status, describe profile).
    pub fn commit_manifest_update<F>(&mut self, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut RunManifest) -> Result<()>,
    {
        self.ensure_write()?;
        let mut next = self.manifest.clone();
        mutator(&mut next)?;
        self.commit(next)
    }

    /// Consistent point-in-time view of the run.
    ///
    /// Read mode re-reads the canonical document so long-lived monitors see
    /// fresh state; write mode returns the in-memory copy, which is always
    /// the last durably committed document.
    pub fn snapshot(&self) -> Result<RunManifest> {
        match self.mode {
            OpenMode::Write => Ok(self.manifest.clone()),
            OpenMode::Read => load_with_recovery(&self.paths, OpenMode::Read),
        }
    }

    fn ensure_write(&self) -> Result<()> {
        if self.mode != OpenMode::Write {
            return Err(anyhow!("store opened read-only"));
        }
        Ok(())
    }

    fn commit(&mut self, next: RunManifest) -> Result<()> {
        let errors = validate_invariants(&next);
        if !errors.is_empty() {
            return Err(anyhow!("refusing commit: {}", errors.join("; ")));
        }
        persist(&self.paths, &next)?;
        self.manifest = next;
        if let Some(lock) = &self.lock {
            lock.refresh()?;
        }
        Ok(())
    }
}

/// Durably publish `manifest`: back up the current canonical file, write a
/// temp sibling, flush to disk, then atomically rename into place.
fn persist(paths: &RunPaths, manifest: &RunManifest) -> Result<()> {
    if paths.manifest_path.exists() {
        fs::copy(&paths.manifest_path, &paths.backup_path)
            .with_context(|| format!("back up {}", paths.manifest_path.display()))?;
    }

    let mut buf = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
    buf.push('\n');

    let mut file = fs::File::create(&paths.manifest_tmp_path)
        .with_context(|| format!("create {}", paths.manifest_tmp_path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write {}", paths.manifest_tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", paths.manifest_tmp_path.display()))?;
    drop(file);

    fs::rename(&paths.manifest_tmp_path, &paths.manifest_path).with_context(|| {
        format!(
            "replace {} with {}",
            paths.manifest_path.display(),
            paths.manifest_tmp_path.display()
        )
    })?;
    Ok(())
}

/// Load and validate one manifest document (parse + schema + invariants).
fn load_manifest_file(path: &Path) -> Result<RunManifest> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate {}", path.display()))?;
    let manifest: RunManifest = serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", path.display()))?;
    let errors = validate_invariants(&manifest);
    if !errors.is_empty() {
        return Err(anyhow!(
            "manifest invariants failed: {}",
            errors.join("; ")
        ));
    }
    Ok(manifest)
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(MANIFEST_SCHEMA).context("parse embedded schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "manifest schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn load_with_recovery(paths: &RunPaths, mode: OpenMode) -> Result<RunManifest> {
    if !paths.manifest_path.exists() && !paths.backup_path.exists() {
        return Err(anyhow!(
            "no manifest found in {}",
            paths.run_dir.display()
        ));
    }

    let canonical_error = match load_manifest_file(&paths.manifest_path) {
        Ok(manifest) => return Ok(manifest),
        Err(err) => {
            warn!(
                path = %paths.manifest_path.display(),
                error = %err,
                "canonical manifest unreadable, trying backup"
            );
            format!("{err:#}")
        }
    };

    match load_manifest_file(&paths.backup_path) {
        Ok(manifest) => {
            info!(
                path = %paths.backup_path.display(),
                "recovered run state from backup"
            );
            if mode == OpenMode::Write {
                persist(paths, &manifest).context("restore canonical manifest from backup")?;
            }
            Ok(manifest)
        }
        Err(backup_err) => Err(UnrecoverableStoreError {
            canonical_error,
            backup_error: format!("{backup_err:#}"),
        }
        .into()),
    }
}
