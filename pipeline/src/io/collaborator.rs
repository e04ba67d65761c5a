//! Collaborator abstraction for step execution.
//!
//! The [`Collaborator`] trait decouples the executor from how a step is
//! actually performed (currently argv-template subprocesses; swappable for
//! in-process calls). Tests use scripted collaborators that return
//! predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;
use crate::manifest::ItemRecord;

/// Parameters for one collaborator invocation.
#[derive(Debug, Clone)]
pub struct StepRequest<'a> {
    pub item: &'a ItemRecord,
    /// Absolute path of the step's input file.
    pub input_path: PathBuf,
    /// Item-scoped artifact directory; outputs are deterministic paths under
    /// it, so a re-run after a crash overwrites identical artifacts.
    pub output_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Model name substituted into the command.
    pub model: String,
    /// Fully rendered describe prompt.
    pub prompt: String,
    /// Canonical image extension for produced files.
    pub canonical_format: String,
}

/// Outcome of a successful collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// The step produced a usable result.
    Produced {
        payload: String,
        /// New describable image, when the step resolves one.
        resolved: Option<PathBuf>,
    },
    /// The step ran cleanly but yielded nothing usable.
    Empty { note: String },
}

/// Abstraction over step execution backends.
pub trait Collaborator {
    fn run(&self, request: &StepRequest<'_>) -> Result<StepOutput>;
}

/// Substitute per-invocation placeholders into an argv template.
fn render_argv(argv: &[String], request: &StepRequest<'_>, output: Option<&Path>) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            let mut rendered = arg
                .replace("{input}", &request.input_path.to_string_lossy())
                .replace("{output_dir}", &request.output_dir.to_string_lossy())
                .replace("{model}", &request.model)
                .replace("{prompt}", &request.prompt);
            if let Some(output) = output {
                rendered = rendered.replace("{output}", &output.to_string_lossy());
            }
            rendered
        })
        .collect()
}

fn run_argv(
    argv: &[String],
    request: &StepRequest<'_>,
    output: Option<&Path>,
) -> Result<crate::io::process::CommandOutput> {
    let rendered = render_argv(argv, request, output);
    let program = rendered
        .first()
        .ok_or_else(|| anyhow!("empty step command"))?;
    let mut cmd = Command::new(program);
    cmd.args(&rendered[1..]);

    let captured = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
        .with_context(|| format!("run {program}"))?;
    if captured.timed_out {
        return Err(anyhow!(
            "{program} timed out after {}s",
            request.timeout.as_secs()
        ));
    }
    if !captured.status.success() {
        return Err(anyhow!(
            "{program} failed with status {:?}: {}",
            captured.status.code(),
            captured.failure_detail()
        ));
    }
    Ok(captured)
}

/// Frame extraction: video in, a directory of canonical-format frames out.
pub struct FrameExtractor {
    pub argv: Vec<String>,
}

impl Collaborator for FrameExtractor {
    #[instrument(skip_all, fields(item = %request.item.id))]
    fn run(&self, request: &StepRequest<'_>) -> Result<StepOutput> {
        fs::create_dir_all(&request.output_dir)
            .with_context(|| format!("create {}", request.output_dir.display()))?;
        run_argv(&self.argv, request, None)?;

        let frames = list_frames(&request.output_dir, &request.canonical_format)?;
        match frames.first() {
            None => {
                warn!(item = %request.item.id, "no frames extracted");
                Ok(StepOutput::Empty {
                    note: "no extractable frames".to_string(),
                })
            }
            Some(first) => {
                debug!(frames = frames.len(), "frames extracted");
                Ok(StepOutput::Produced {
                    payload: format!("extracted {} frames", frames.len()),
                    resolved: Some(first.clone()),
                })
            }
        }
    }
}

/// Format conversion: any image in, one canonical-format image out.
pub struct FormatConverter {
    pub argv: Vec<String>,
}

impl Collaborator for FormatConverter {
    #[instrument(skip_all, fields(item = %request.item.id))]
    fn run(&self, request: &StepRequest<'_>) -> Result<StepOutput> {
        fs::create_dir_all(&request.output_dir)
            .with_context(|| format!("create {}", request.output_dir.display()))?;
        let output = request
            .output_dir
            .join(format!("converted.{}", request.canonical_format));
        run_argv(&self.argv, request, Some(&output))?;

        if !output.exists() {
            return Err(anyhow!(
                "converter produced no output at {}",
                output.display()
            ));
        }
        Ok(StepOutput::Produced {
            payload: format!("converted to {}", request.canonical_format),
            resolved: Some(output),
        })
    }
}

/// Description: describable image in, text on stdout out.
pub struct CommandDescriber {
    pub argv: Vec<String>,
}

impl Collaborator for CommandDescriber {
    #[instrument(skip_all, fields(item = %request.item.id))]
    fn run(&self, request: &StepRequest<'_>) -> Result<StepOutput> {
        let captured = run_argv(&self.argv, request, None)?;
        let text = String::from_utf8_lossy(&captured.stdout).trim().to_string();
        if text.is_empty() {
            return Err(anyhow!("describer returned an empty description"));
        }
        Ok(StepOutput::Produced {
            payload: text,
            resolved: None,
        })
    }
}

fn list_frames(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read artifacts entry")?;
        let path = entry.path();
        let matches = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if path.is_file() && matches {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MediaKind;

    fn request<'a>(item: &'a ItemRecord, dir: &Path) -> StepRequest<'a> {
        StepRequest {
            item,
            input_path: dir.join("input.mp4"),
            output_dir: dir.join("artifacts"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            model: "test-model".to_string(),
            prompt: "describe it".to_string(),
            canonical_format: "png".to_string(),
        }
    }

    #[test]
    fn render_argv_substitutes_placeholders() {
        let item = ItemRecord::new("a".to_string(), "a.mp4".into(), MediaKind::Video);
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(&item, temp.path());
        let argv = vec![
            "tool".to_string(),
            "{input}".to_string(),
            "{output_dir}/out".to_string(),
            "--model={model}".to_string(),
        ];
        let rendered = render_argv(&argv, &req, None);
        assert_eq!(rendered[1], req.input_path.to_string_lossy());
        assert!(rendered[2].ends_with("artifacts/out"));
        assert_eq!(rendered[3], "--model=test-model");
    }

    #[test]
    fn extractor_reports_empty_when_no_frames_appear() {
        let item = ItemRecord::new("a".to_string(), "a.mp4".into(), MediaKind::Video);
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(&item, temp.path());
        // `true` exits 0 without writing frames.
        let extractor = FrameExtractor {
            argv: vec!["true".to_string()],
        };
        let output = extractor.run(&req).expect("run");
        assert!(matches!(output, StepOutput::Empty { .. }));
    }

    #[test]
    fn extractor_resolves_first_frame_in_sorted_order() {
        let item = ItemRecord::new("a".to_string(), "a.mp4".into(), MediaKind::Video);
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(&item, temp.path());
        fs::create_dir_all(&req.output_dir).expect("mkdir");
        fs::write(req.output_dir.join("frame_0002.png"), b"x").expect("write");
        fs::write(req.output_dir.join("frame_0001.png"), b"x").expect("write");
        fs::write(req.output_dir.join("notes.txt"), b"x").expect("write");

        let extractor = FrameExtractor {
            argv: vec!["true".to_string()],
        };
        let output = extractor.run(&req).expect("run");
        match output {
            StepOutput::Produced { payload, resolved } => {
                assert_eq!(payload, "extracted 2 frames");
                assert!(
                    resolved
                        .expect("resolved")
                        .ends_with("artifacts/frame_0001.png")
                );
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn converter_requires_its_output_file() {
        let item = ItemRecord::new("a".to_string(), "a.jpg".into(), MediaKind::Image);
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(&item, temp.path());
        let converter = FormatConverter {
            argv: vec!["true".to_string()],
        };
        let err = converter.run(&req).unwrap_err();
        assert!(err.to_string().contains("no output"));
    }

    #[test]
    fn describer_captures_stdout_text() {
        let item = ItemRecord::new("a".to_string(), "a.png".into(), MediaKind::Image);
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(&item, temp.path());
        let describer = CommandDescriber {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo a grey cat".to_string(),
            ],
        };
        let output = describer.run(&req).expect("run");
        assert_eq!(
            output,
            StepOutput::Produced {
                payload: "a grey cat".to_string(),
                resolved: None,
            }
        );
    }

    #[test]
    fn failing_command_surfaces_stderr() {
        let item = ItemRecord::new("a".to_string(), "a.png".into(), MediaKind::Image);
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(&item, temp.path());
        let describer = CommandDescriber {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo bad input >&2; exit 2".to_string(),
            ],
        };
        let err = describer.run(&req).unwrap_err();
        assert!(err.to_string().contains("bad input"));
    }
}
