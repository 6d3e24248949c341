mod concat;
mod doctor;
mod error;
mod interpreter;
mod pipeline;
mod process;
mod render;
mod settings;
mod shell;
mod tutorial;
mod typing;

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::doctor::run_doctor;
use crate::error::{find_pipeline_error, ErrorEnvelope, ErrorEnvelopeBody, PipelineError};
use crate::pipeline::run_tutorial;
use crate::settings::{load_settings, FfmpegMode, Settings};
use crate::tutorial::{lint_shell_order, load_tutorial, Tutorial};

#[derive(Debug, Parser)]
#[command(name = "tutgen")]
#[command(about = "Compile a JSON coding tutorial into a single video")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("TUTGEN_GIT_HASH"), ")"))]
struct Cli {
    /// Tutorial description (JSON).
    #[arg(required_unless_present = "doctor")]
    tutorial: Option<PathBuf>,

    /// Settings file. Defaults to ./tutgen.yaml when present.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for intermediate segments instead of a fresh run directory.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Keep intermediate segments after a successful run.
    #[arg(long)]
    keep_segments: bool,

    #[arg(long, value_name = "MODE", value_parser = FfmpegMode::parse)]
    ffmpeg: Option<FfmpegMode>,

    /// Validate the tutorial and print a summary without rendering.
    #[arg(long, conflicts_with = "doctor")]
    check: bool,

    /// Probe vhs, ffmpeg, the browser recorder and the shell.
    #[arg(long)]
    doctor: bool,

    /// Machine-readable result on stdout.
    #[arg(long)]
    json: bool,

    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(code) => code,
        Err(error) => report_failure(&cli, &error),
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose > 0 {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let cwd = env::current_dir().context("failed to resolve working directory")?;
    let settings = resolve_cli_settings(cli, &cwd)?;

    if cli.doctor {
        return Ok(doctor(&settings, cli.json));
    }

    let tutorial_path = cli
        .tutorial
        .as_deref()
        .ok_or_else(|| anyhow!("a tutorial file is required"))?;
    let tutorial = load_tutorial(tutorial_path)?;

    if cli.check {
        check(tutorial_path, &tutorial, cli.json);
        return Ok(ExitCode::SUCCESS);
    }

    info!(tutorial = %tutorial_path.display(), "rendering tutorial");
    let summary = run_tutorial(
        &settings,
        &tutorial,
        tutorial_path,
        &cwd,
        cli.work_dir.as_deref(),
    )?;

    if cli.json {
        println!(
            "{}",
            json!({
                "ok": true,
                "output": summary.output,
                "segments": summary.segments,
                "run_id": summary.run_id,
                "record": summary.record_path,
            })
        );
    } else {
        match &summary.output {
            Some(output) => println!(
                "Wrote {} ({} segments)",
                output.display(),
                summary.segments
            ),
            None => println!("Nothing to assemble; no video written."),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn resolve_cli_settings(cli: &Cli, cwd: &Path) -> Result<Settings> {
    let mut settings = load_settings(cli.config.as_deref(), cwd)
        .map_err(|error| PipelineError::config(format!("{error:#}")))?;
    if cli.keep_segments {
        settings.keep_segments = true;
    }
    if let Some(mode) = cli.ffmpeg {
        settings.ffmpeg_mode = mode;
    }
    Ok(settings)
}

fn check(path: &Path, tutorial: &Tutorial, as_json: bool) {
    let mut kinds = BTreeMap::<&str, usize>::new();
    for command in &tutorial.commands {
        *kinds.entry(command.kind()).or_default() += 1;
    }
    let warnings = lint_shell_order(tutorial);

    if as_json {
        println!(
            "{}",
            json!({
                "ok": true,
                "tutorial": path,
                "output": tutorial.output_video_name,
                "commands": tutorial.commands.len(),
                "kinds": kinds,
                "intro_lines": tutorial.intro_outro.intro_code.len(),
                "outro_lines": tutorial.intro_outro.outro_code.len(),
                "warnings": warnings,
            })
        );
        return;
    }

    println!(
        "OK: {} ({} commands, output {})",
        path.display(),
        tutorial.commands.len(),
        tutorial.output_video_name.display()
    );
    for (kind, count) in &kinds {
        println!("  {kind}: {count}");
    }
    println!(
        "Intro lines: {}, outro lines: {}",
        tutorial.intro_outro.intro_code.len(),
        tutorial.intro_outro.outro_code.len()
    );
    for warning in &warnings {
        println!("warning: {warning}");
    }
}

fn doctor(settings: &Settings, as_json: bool) -> ExitCode {
    let report = run_doctor(settings);
    if as_json {
        println!(
            "{}",
            json!({ "ok": report.ok, "diagnostics": report.diagnostics })
        );
    } else {
        for line in &report.diagnostics {
            println!("{line}");
        }
    }
    if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report_failure(cli: &Cli, error: &anyhow::Error) -> ExitCode {
    let (exit_code, envelope) = match find_pipeline_error(error) {
        Some(pipeline_error) => (pipeline_error.exit_code(), pipeline_error.envelope()),
        None => (
            1,
            ErrorEnvelope {
                ok: false,
                error: ErrorEnvelopeBody {
                    code: String::from("internal_error"),
                    message: format!("{error:#}"),
                    details: None,
                },
            },
        ),
    };

    if cli.json {
        match serde_json::to_string(&envelope) {
            Ok(text) => println!("{text}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
    } else {
        eprintln!("error: {error:#}");
    }
    ExitCode::from(u8::try_from(exit_code).unwrap_or(1))
}
