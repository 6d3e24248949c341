use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::process::run_tool;
use crate::settings::{FfmpegMode, Settings};

/// Joins rendered clips, in the given order, into one video.
pub trait Concatenator {
    fn mode_label(&self) -> &'static str;
    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

pub struct FfmpegConcat {
    program: PathBuf,
    mode_label: &'static str,
    format: OutputFormat,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
}

impl FfmpegConcat {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let format = OutputFormat {
            width: settings.terminal.width,
            height: settings.terminal.height,
            fps: settings.fps,
        };
        let (program, mode_label) = resolve_program(settings.ffmpeg_mode, &settings.ffmpeg_binary)?;
        Ok(Self {
            program,
            mode_label,
            format,
            timeout: settings.render_timeout,
            env: settings.env.clone(),
        })
    }
}

fn resolve_program(mode: FfmpegMode, binary: &str) -> Result<(PathBuf, &'static str)> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok((PathBuf::from(binary), "system")),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                let path = ffmpeg_sidecar::paths::ffmpeg_path();
                if !path.exists() {
                    ffmpeg_sidecar::download::auto_download()
                        .context("failed to auto-download ffmpeg sidecar binary")?;
                }
                Ok((path, "sidecar"))
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                let _ = binary;
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but tutgen was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

impl Concatenator for FfmpegConcat {
    fn mode_label(&self) -> &'static str {
        self.mode_label
    }

    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let path_str = output.to_string_lossy();
        if path_str.chars().any(char::is_control) {
            bail!("output path contains invalid control characters");
        }

        let args = concat_args(inputs, output, self.format);
        let mut command = Command::new(&self.program);
        command.args(&args).envs(&self.env);
        run_tool(
            &format!("ffmpeg ({})", self.mode_label),
            &mut command,
            self.timeout,
        )?;
        Ok(())
    }
}

/// Every input is scaled and padded to the output frame first, since the
/// concat filter needs identical geometry across clips.
pub fn concat_args(inputs: &[PathBuf], output: &Path, format: OutputFormat) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
    ];
    for input in inputs {
        args.push("-i".to_owned());
        args.push(input.to_string_lossy().into_owned());
    }

    let OutputFormat { width, height, fps } = format;
    let mut filter = String::new();
    for index in 0..inputs.len() {
        filter.push_str(&format!(
            "[{index}:v]scale={width}:{height}:force_original_aspect_ratio=decrease,\
             pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps}[v{index}];"
        ));
    }
    for index in 0..inputs.len() {
        filter.push_str(&format!("[v{index}]"));
    }
    filter.push_str(&format!("concat=n={}:v=1:a=0[out]", inputs.len()));

    args.extend([
        "-filter_complex".to_owned(),
        filter,
        "-map".to_owned(),
        "[out]".to_owned(),
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
    ]);
    args.extend(container_output_args(output));
    args.push(output.to_string_lossy().into_owned());
    args
}

pub fn container_output_args(output: &Path) -> Vec<String> {
    let ext = output
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "mov" | "mp4" | "m4v") {
        vec!["-movflags".to_owned(), "+faststart".to_owned()]
    } else {
        Vec::new()
    }
}

/// Checks the inputs, runs the concatenator once and confirms the result.
pub fn assemble(
    concatenator: &dyn Concatenator,
    inputs: &[PathBuf],
    output: &Path,
) -> PipelineResult<()> {
    if inputs.is_empty() {
        return Err(PipelineError::assembly(
            output,
            "the tutorial produced no video segments",
        ));
    }
    if let Some(missing) = inputs.iter().find(|input| !input.is_file()) {
        return Err(PipelineError::assembly(
            output,
            format!("segment {} is missing", missing.display()),
        ));
    }
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))
            .map_err(|error| PipelineError::assembly(output, format!("{error:#}")))?;
    }

    concatenator
        .concatenate(inputs, output)
        .map_err(|error| PipelineError::assembly(output, format!("{error:#}")))?;
    if !output.is_file() {
        return Err(PipelineError::assembly(
            output,
            format!("{} reported success but wrote no file", concatenator.mode_label()),
        ));
    }
    info!(
        output = %output.display(),
        segments = inputs.len(),
        mode = concatenator.mode_label(),
        "assembled final video"
    );
    Ok(())
}
