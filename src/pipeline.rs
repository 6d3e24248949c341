use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::concat::{assemble, Concatenator, FfmpegConcat};
use crate::error::{PipelineError, PipelineResult};
use crate::interpreter::Interpreter;
use crate::render::{Segment, SegmentRenderer, SegmentRole};
use crate::settings::{resolve_against_base_path, Settings};
use crate::shell::{ShellEvent, ShellOptions, ShellRegistry};
use crate::tutorial::Tutorial;

static RUN_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub timestamp: DateTime<Local>,
    pub run_id: String,
    pub tutorial_path: PathBuf,
    pub work_dir: PathBuf,
    pub output: PathBuf,
    pub record_path: PathBuf,
    pub keep_segments: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub timestamp: String,
    pub run_id: String,
    pub tutorial_path: String,
    pub output_path: String,
    pub output_written: bool,
    pub work_dir: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_command_index: Option<usize>,
    pub segments: Vec<Segment>,
    pub segments_kept: bool,
    pub shell_history: Vec<ShellEvent>,
    pub record_path_written: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    /// `None` when the tutorial produced nothing to assemble.
    pub output: Option<PathBuf>,
    pub segments: usize,
    pub record_path: PathBuf,
}

/// Picks the run id and every path a run will touch.
pub fn plan_run(
    settings: &Settings,
    tutorial: &Tutorial,
    tutorial_path: &Path,
    cwd: &Path,
    work_dir_override: Option<&Path>,
    timestamp: DateTime<Local>,
) -> RunPlan {
    let run_id = next_run_id(tutorial_path, &timestamp);
    let work_dir = match work_dir_override {
        Some(path) => resolve_against_base_path(path, cwd),
        None => settings.runs_dir.join(&run_id),
    };
    let record_path = settings
        .runs_dir
        .join("records")
        .join(format!("{run_id}.json"));
    RunPlan {
        timestamp,
        run_id,
        tutorial_path: tutorial_path.to_path_buf(),
        work_dir,
        output: resolve_against_base_path(&tutorial.output_video_name, cwd),
        record_path,
        keep_segments: settings.keep_segments,
    }
}

/// Runs a tutorial with the collaborators named in `settings`.
pub fn run_tutorial(
    settings: &Settings,
    tutorial: &Tutorial,
    tutorial_path: &Path,
    cwd: &Path,
    work_dir_override: Option<&Path>,
) -> PipelineResult<RunSummary> {
    let plan = plan_run(
        settings,
        tutorial,
        tutorial_path,
        cwd,
        work_dir_override,
        Local::now(),
    );
    let concat = FfmpegConcat::from_settings(settings)
        .map_err(|error| PipelineError::assembly(&plan.output, format!("{error:#}")))?;
    let mut renderer = SegmentRenderer::from_settings(settings, &plan.work_dir);
    let mut registry = ShellRegistry::new(shell_options(settings));
    execute_run(&plan, tutorial, &mut renderer, &mut registry, &concat)
}

pub fn shell_options(settings: &Settings) -> ShellOptions {
    let mut options = ShellOptions::new(settings.shell.clone());
    options.env = settings.env.clone();
    options.command_timeout = settings.shell_timeout;
    options.terminate_grace = settings.terminate_grace;
    options
}

/// Renders intro, commands and outro, stops the subshells, then assembles and
/// cleans up.
///
/// Every session the registry started is gone when this returns, whatever the
/// outcome. Segments are deleted only after a successful assembly. A tutorial
/// that yields no segment at all succeeds without writing a video.
pub fn execute_run(
    plan: &RunPlan,
    tutorial: &Tutorial,
    renderer: &mut SegmentRenderer,
    registry: &mut ShellRegistry,
    concat: &dyn Concatenator,
) -> PipelineResult<RunSummary> {
    info!(
        run_id = %plan.run_id,
        commands = tutorial.commands.len(),
        work_dir = %plan.work_dir.display(),
        "starting run"
    );

    let mut ordering = Vec::new();
    let result = render_all(plan, tutorial, renderer, registry, &mut ordering);
    let stopped = registry.terminate_all();
    if stopped > 0 {
        info!(stopped, "stopped subshells left running by the tutorial");
    }

    let result = result.and_then(|()| {
        number(&mut ordering);
        if ordering.is_empty() {
            warn!(
                output = %plan.output.display(),
                "no clips to assemble; no video written"
            );
            return Ok(false);
        }
        let inputs = ordering
            .iter()
            .map(|segment| segment.path.clone())
            .collect::<Vec<_>>();
        assemble(concat, &inputs, &plan.output).map(|()| true)
    });

    let segments_kept = result.is_err() || plan.keep_segments;
    if result.is_ok() && !plan.keep_segments {
        cleanup_segments(&plan.work_dir, &ordering);
    }

    let record = run_record(plan, &result, &ordering, segments_kept, registry.history());
    if let Err(error) = write_run_record(&plan.record_path, &record) {
        warn!(error = %format!("{error:#}"), "could not write run record");
    }

    result.map(|written| RunSummary {
        run_id: plan.run_id.clone(),
        output: written.then(|| plan.output.clone()),
        segments: ordering.len(),
        record_path: plan.record_path.clone(),
    })
}

fn render_all(
    plan: &RunPlan,
    tutorial: &Tutorial,
    renderer: &mut SegmentRenderer,
    registry: &mut ShellRegistry,
    ordering: &mut Vec<Segment>,
) -> PipelineResult<()> {
    fs::create_dir_all(&plan.work_dir)
        .with_context(|| format!("failed to create {}", plan.work_dir.display()))
        .map_err(|error| PipelineError::render("work directory", &error))?;

    if let Some(intro) =
        renderer.render_bookend(SegmentRole::Intro, &tutorial.intro_outro.intro_code)?
    {
        ordering.push(intro);
    }

    let mut interpreter = Interpreter::new(renderer, registry);
    let outcome = interpreter.run(&tutorial.commands);
    debug!(
        state = ?interpreter.state(),
        segments = interpreter.segments().len(),
        "interpreter stopped"
    );
    ordering.extend(interpreter.into_segments());
    outcome?;

    if let Some(outro) =
        renderer.render_bookend(SegmentRole::Outro, &tutorial.intro_outro.outro_code)?
    {
        ordering.push(outro);
    }
    Ok(())
}

fn number(ordering: &mut [Segment]) {
    for (key, segment) in ordering.iter_mut().enumerate() {
        segment.ordering_key = key;
    }
}

fn cleanup_segments(work_dir: &Path, ordering: &[Segment]) {
    for segment in ordering {
        for path in [segment.path.clone(), segment.path.with_extension("tape")] {
            if let Err(error) = fs::remove_file(&path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %error, "could not delete intermediate file");
                }
            }
        }
    }
    // Only succeeds when nothing else lives there.
    let _ = fs::remove_dir(work_dir);
}

fn run_record(
    plan: &RunPlan,
    result: &PipelineResult<bool>,
    ordering: &[Segment],
    segments_kept: bool,
    history: &[ShellEvent],
) -> RunRecord {
    let failure = result.as_ref().err();
    RunRecord {
        timestamp: plan.timestamp.to_rfc3339(),
        run_id: plan.run_id.clone(),
        tutorial_path: plan.tutorial_path.to_string_lossy().to_string(),
        output_path: plan.output.to_string_lossy().to_string(),
        output_written: matches!(result, Ok(true)),
        work_dir: plan.work_dir.to_string_lossy().to_string(),
        ok: failure.is_none(),
        error_code: failure.map(|error| error.code().to_owned()),
        error_message: failure.map(ToString::to_string),
        failed_command_index: failure.and_then(PipelineError::command_index),
        segments: ordering.to_vec(),
        segments_kept,
        shell_history: history.to_vec(),
        record_path_written: plan.record_path.to_string_lossy().to_string(),
    }
}

pub fn write_run_record(record_path: &Path, record: &RunRecord) -> Result<()> {
    if let Some(parent) = record_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create run record directory {}", parent.display())
        })?;
    }
    let serialized =
        serde_json::to_string_pretty(record).context("failed to serialize run record")?;
    fs::write(record_path, format!("{serialized}\n"))
        .with_context(|| format!("failed to write run record {}", record_path.display()))?;
    Ok(())
}

fn next_run_id(tutorial_path: &Path, timestamp: &DateTime<Local>) -> String {
    let formatted = timestamp.format("%Y%m%d_%H%M%S").to_string();
    let stem = tutorial_path
        .file_stem()
        .map(|stem| {
            stem.to_string_lossy()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect::<String>()
        })
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| String::from("tutorial"));
    let count = RUN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{formatted}_{stem}_{count:03}")
}
