//! Resumable media description pipeline CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use pipeline::core::stats::{aggregate, render_text};
use pipeline::executor::{StepBindings, StopFlag};
use pipeline::exit_codes;
use pipeline::io::collaborator::{CommandDescriber, FormatConverter, FrameExtractor};
use pipeline::io::config::{PipelineConfig, load_config};
use pipeline::io::lock::LockHeldError;
use pipeline::io::store::{OpenMode, Store, UnrecoverableStoreError};
use pipeline::manifest::RunStatus;
use pipeline::resume::ResumeOverrides;
use pipeline::run::{NewRunRequest, RunSummary, resume_run, start_run};

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Resumable media description batch pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run over an input directory.
    Run {
        /// Directory containing the media files to process.
        #[arg(long)]
        input: PathBuf,
        /// Directory to create the run state in.
        #[arg(long)]
        run_dir: PathBuf,
        /// Optional config TOML; defaults are used when absent.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured description provider.
        #[arg(long)]
        provider: Option<String>,
        /// Override the configured model.
        #[arg(long)]
        model: Option<String>,
        /// Override the configured prompt text.
        #[arg(long)]
        prompt: Option<String>,
        /// Do not recurse into subdirectories.
        #[arg(long)]
        no_recursive: bool,
    },
    /// Resume an interrupted or finished run directory.
    Resume {
        run_dir: PathBuf,
        /// Describe with a different provider, keeping prior results.
        #[arg(long)]
        provider: Option<String>,
        /// Describe with a different model, keeping prior results.
        #[arg(long)]
        model: Option<String>,
        /// Describe with a different prompt.
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Print a one-line progress summary for a run directory.
    Status { run_dir: PathBuf },
    /// Print full statistics for a run directory.
    Stats { run_dir: PathBuf },
    /// Validate a run directory (schema + invariants).
    Check { run_dir: PathBuf },
}

fn main() -> ExitCode {
    pipeline::logging::init();
    match dispatch() {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(error_code(&err) as u8)
        }
    }
}

fn dispatch() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            input,
            run_dir,
            config,
            provider,
            model,
            prompt,
            no_recursive,
        } => {
            let mut cfg = match config {
                Some(path) => load_config(&path)?,
                None => PipelineConfig::default(),
            };
            if let Some(provider) = provider {
                cfg.provider = provider;
            }
            if let Some(model) = model {
                cfg.model = model;
            }
            if let Some(prompt) = prompt {
                cfg.prompt = prompt;
            }
            if no_recursive {
                cfg.recursive = false;
            }

            let stop = install_stop_handler()?;
            let request = NewRunRequest {
                input_root: input,
                run_dir,
                config: cfg.clone(),
            };
            let summary = with_bindings(&cfg, |bindings| start_run(&request, bindings, &stop))?;
            print_summary(&summary);
            Ok(summary_code(&summary))
        }
        Command::Resume {
            run_dir,
            provider,
            model,
            prompt,
        } => {
            let cfg = load_config(&pipeline::io::paths::RunPaths::new(&run_dir).config_path)?;
            let overrides = ResumeOverrides {
                provider,
                model,
                prompt,
            };
            let stop = install_stop_handler()?;
            let summary =
                with_bindings(&cfg, |bindings| resume_run(&run_dir, &overrides, bindings, &stop))?;
            print_summary(&summary);
            Ok(summary_code(&summary))
        }
        Command::Status { run_dir } => {
            let store = Store::open(&run_dir, OpenMode::Read)?;
            let snapshot = store.snapshot()?;
            println!(
                "run {} ({:?}): {}/{} completed, {} failed",
                snapshot.run_id,
                snapshot.status,
                snapshot.completed_count(),
                snapshot.items.len(),
                snapshot.failed_count()
            );
            Ok(exit_codes::OK)
        }
        Command::Stats { run_dir } => {
            let store = Store::open(&run_dir, OpenMode::Read)?;
            let snapshot = store.snapshot()?;
            let stats = aggregate(&snapshot, Utc::now());
            print!("{}", render_text(&stats));
            Ok(exit_codes::OK)
        }
        Command::Check { run_dir } => {
            let store = Store::open(&run_dir, OpenMode::Read)?;
            println!("ok: run {} is well-formed", store.manifest().run_id);
            Ok(exit_codes::OK)
        }
    }
}

/// Build the subprocess collaborators from config and hand them to `f`.
fn with_bindings<T>(
    cfg: &PipelineConfig,
    f: impl FnOnce(&StepBindings<'_>) -> Result<T>,
) -> Result<T> {
    let extract = FrameExtractor {
        argv: cfg.extract.command.clone(),
    };
    let convert = FormatConverter {
        argv: cfg.convert.command.clone(),
    };
    let describe = CommandDescriber {
        argv: cfg.describe.command.clone(),
    };
    f(&StepBindings {
        extract: &extract,
        convert: &convert,
        describe: &describe,
    })
}

fn install_stop_handler() -> Result<StopFlag> {
    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        eprintln!("stop requested; finishing current step");
        handler_stop.trigger();
    })
    .context("install stop handler")?;
    Ok(stop)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} ({:?}): {}/{} completed, {} failed, {} scan warnings",
        summary.run_id,
        summary.status,
        summary.completed,
        summary.total_items,
        summary.failed,
        summary.scan_warnings
    );
}

fn summary_code(summary: &RunSummary) -> i32 {
    match summary.status {
        RunStatus::Aborted => exit_codes::ABORTED,
        _ if summary.failed > 0 => exit_codes::PARTIAL,
        _ => exit_codes::OK,
    }
}

fn error_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<LockHeldError>().is_some() {
        return exit_codes::LOCKED;
    }
    if err.downcast_ref::<UnrecoverableStoreError>().is_some() {
        return exit_codes::UNRECOVERABLE;
    }
    exit_codes::INVALID
}
