//! Run configuration stored under `<run-dir>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classify::MediaExtensions;

/// Pipeline configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Description provider identity (for result attribution).
    pub provider: String,
    /// Model name, substituted into the describe command.
    pub model: String,
    /// Describe prompt text; rendered through the prompt template.
    pub prompt: String,

    /// Failed-execution budget per item/step before the step is terminal.
    pub max_attempts: u32,

    /// Wall-clock budget per collaborator invocation, in seconds.
    pub step_timeout_secs: u64,

    /// Truncate collaborator stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Recurse into subdirectories of the input root.
    pub recursive: bool,

    /// Canonical describable image format (file extension, lowercase).
    pub canonical_format: String,
    pub image_extensions: Vec<String>,
    pub video_extensions: Vec<String>,

    pub extract: StepCommand,
    pub convert: StepCommand,
    pub describe: StepCommand,
}

/// Command bound to one step. Placeholders `{input}`, `{output}`,
/// `{output_dir}`, `{model}`, `{prompt}` are substituted per invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepCommand {
    pub command: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "default".to_string(),
            prompt: "Describe this image in one detailed paragraph.".to_string(),
            max_attempts: 2,
            step_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            recursive: true,
            canonical_format: "png".to_string(),
            image_extensions: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "gif".to_string(),
                "bmp".to_string(),
                "webp".to_string(),
            ],
            video_extensions: vec![
                "mp4".to_string(),
                "mov".to_string(),
                "mkv".to_string(),
                "avi".to_string(),
                "webm".to_string(),
            ],
            extract: StepCommand {
                command: vec![
                    "ffmpeg".to_string(),
                    "-hide_banner".to_string(),
                    "-loglevel".to_string(),
                    "error".to_string(),
                    "-i".to_string(),
                    "{input}".to_string(),
                    "-vf".to_string(),
                    "fps=1/10".to_string(),
                    "{output_dir}/frame_%04d.png".to_string(),
                ],
            },
            convert: StepCommand {
                command: vec![
                    "ffmpeg".to_string(),
                    "-hide_banner".to_string(),
                    "-loglevel".to_string(),
                    "error".to_string(),
                    "-i".to_string(),
                    "{input}".to_string(),
                    "-y".to_string(),
                    "{output}".to_string(),
                ],
            },
            describe: StepCommand {
                command: vec![
                    "describe-image".to_string(),
                    "--model".to_string(),
                    "{model}".to_string(),
                    "--prompt".to_string(),
                    "{prompt}".to_string(),
                    "{input}".to_string(),
                ],
            },
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.canonical_format.trim().is_empty() {
            return Err(anyhow!("canonical_format must not be empty"));
        }
        if self.image_extensions.is_empty() {
            return Err(anyhow!("image_extensions must not be empty"));
        }
        for (name, step) in [
            ("extract", &self.extract),
            ("convert", &self.convert),
            ("describe", &self.describe),
        ] {
            if step.command.is_empty() || step.command[0].trim().is_empty() {
                return Err(anyhow!("{name}.command must be a non-empty array"));
            }
        }
        Ok(())
    }

    /// Extension sets for the classifier.
    pub fn extensions(&self) -> MediaExtensions {
        MediaExtensions {
            image: self.image_extensions.clone(),
            video: self.video_extensions.clone(),
            canonical: self.canonical_format.clone(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
