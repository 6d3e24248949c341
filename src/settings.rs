use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SETTINGS_FILE_NAME: &str = "tutgen.yaml";
const DEFAULT_VHS_BINARY: &str = "vhs";
const DEFAULT_SHELL: &str = "bash";
const DEFAULT_THEME: &str = "Cobalt Neon";
const DEFAULT_RUNS_DIR: &str = ".tutgen/runs";
const DEFAULT_BROWSER_BINARY: &str = "tutgen-browser-record";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

impl FfmpegMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "system" => Ok(Self::System),
            "sidecar" => Ok(Self::Sidecar),
            other => bail!("unknown ffmpeg mode '{other}' (expected auto, system or sidecar)"),
        }
    }
}

/// Whether subshell commands get a visible segment of their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellSegments {
    #[default]
    None,
    Typed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSettingsFile {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub vhs_binary: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub typing_speed_ms: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub font_size: Option<u32>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub words_per_minute: Option<u32>,
    #[serde(default)]
    pub settle_ms: Option<u64>,
    #[serde(default)]
    pub render_timeout_secs: Option<u64>,
    #[serde(default)]
    pub shell_timeout_secs: Option<u64>,
    #[serde(default)]
    pub terminate_grace_ms: Option<u64>,
    #[serde(default)]
    pub ffmpeg_mode: Option<FfmpegMode>,
    #[serde(default)]
    pub ffmpeg_binary: Option<String>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub runs_dir: Option<String>,
    #[serde(default)]
    pub keep_segments: Option<bool>,
    #[serde(default)]
    pub shell_segments: Option<ShellSegments>,
    #[serde(default)]
    pub browser: BrowserSettingsFile,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSettings {
    pub vhs_binary: String,
    pub typing_speed_ms: u64,
    pub width: u32,
    pub height: u32,
    pub font_size: u32,
    pub theme: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrationSettings {
    /// Approximate reading rate used to size narration pauses. Tunable.
    pub words_per_minute: u32,
    pub settle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserSettings {
    /// Argv template. Placeholders: {url} {output} {text} {width} {height}
    /// {duration_ms} {timeout_ms}.
    pub command: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source: Option<PathBuf>,
    pub shell: String,
    pub terminal: TerminalSettings,
    pub narration: NarrationSettings,
    pub render_timeout: Option<Duration>,
    pub shell_timeout: Option<Duration>,
    pub terminate_grace: Duration,
    pub ffmpeg_mode: FfmpegMode,
    pub ffmpeg_binary: String,
    pub fps: u32,
    pub runs_dir: PathBuf,
    pub keep_segments: bool,
    pub shell_segments: ShellSegments,
    pub browser: BrowserSettings,
    pub env: BTreeMap<String, String>,
}

pub fn default_browser_command() -> Vec<String> {
    [
        DEFAULT_BROWSER_BINARY,
        "--url",
        "{url}",
        "--output",
        "{output}",
        "--width",
        "{width}",
        "--height",
        "{height}",
        "--duration-ms",
        "{duration_ms}",
        "--timeout-ms",
        "{timeout_ms}",
    ]
    .iter()
    .map(|value| (*value).to_owned())
    .collect()
}

/// `--config` wins; otherwise `tutgen.yaml` in the working directory if present.
pub fn locate_settings(config_override: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = config_override {
        return Some(resolve_against_base_path(path, cwd));
    }
    let candidate = cwd.join(DEFAULT_SETTINGS_FILE_NAME);
    candidate.is_file().then_some(candidate)
}

pub fn load_settings(config_override: Option<&Path>, cwd: &Path) -> Result<Settings> {
    match locate_settings(config_override, cwd) {
        Some(path) => {
            let file = load_settings_file(&path)?;
            resolve_settings(file, Some(&path), cwd)
        }
        None => resolve_settings(SettingsFile::default(), None, cwd),
    }
}

pub fn load_settings_file(path: &Path) -> Result<SettingsFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings at {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(SettingsFile::default());
    }
    serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse settings yaml at {}", path.display()))
}

pub fn resolve_settings(file: SettingsFile, source: Option<&Path>, cwd: &Path) -> Result<Settings> {
    let base_dir = source
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf());

    let width = file.width.unwrap_or(1920);
    let height = file.height.unwrap_or(1080);
    if width == 0 || height == 0 {
        bail!("terminal size must be non-zero, got {width}x{height}");
    }
    let words_per_minute = file.words_per_minute.unwrap_or(150);
    if words_per_minute == 0 {
        bail!("words_per_minute must be greater than zero");
    }
    let fps = file.fps.unwrap_or(30);
    if fps == 0 {
        bail!("fps must be greater than zero");
    }

    let browser_command = file
        .browser
        .command
        .filter(|command| !command.is_empty())
        .unwrap_or_else(default_browser_command);
    if !browser_command.iter().any(|arg| arg.contains("{output}")) {
        bail!("browser.command must pass {{output}} to the recorder");
    }

    let runs_dir = match file.runs_dir.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => resolve_against_base_path(Path::new(value), &base_dir),
        _ => cwd.join(DEFAULT_RUNS_DIR),
    };

    Ok(Settings {
        source: source.map(Path::to_path_buf),
        shell: non_empty_or(file.shell, DEFAULT_SHELL),
        terminal: TerminalSettings {
            vhs_binary: non_empty_or(file.vhs_binary, DEFAULT_VHS_BINARY),
            typing_speed_ms: file.typing_speed_ms.unwrap_or(75),
            width,
            height,
            font_size: file.font_size.unwrap_or(22),
            theme: non_empty_or(file.theme, DEFAULT_THEME),
        },
        narration: NarrationSettings {
            words_per_minute,
            settle: Duration::from_millis(file.settle_ms.unwrap_or(500)),
        },
        render_timeout: timeout_secs(file.render_timeout_secs, 600),
        shell_timeout: timeout_secs(file.shell_timeout_secs, 300),
        terminate_grace: Duration::from_millis(file.terminate_grace_ms.unwrap_or(2000)),
        ffmpeg_mode: file.ffmpeg_mode.unwrap_or_default(),
        ffmpeg_binary: non_empty_or(file.ffmpeg_binary, "ffmpeg"),
        fps,
        runs_dir: normalize_path(runs_dir),
        keep_segments: file.keep_segments.unwrap_or(false),
        shell_segments: file.shell_segments.unwrap_or_default(),
        browser: BrowserSettings {
            command: browser_command,
            timeout: Duration::from_secs(file.browser.timeout_secs.unwrap_or(60).max(1)),
        },
        env: file.env,
    })
}

// Zero disables the timeout.
fn timeout_secs(value: Option<u64>, default: u64) -> Option<Duration> {
    match value.unwrap_or(default) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_owned()
}

pub fn resolve_against_base_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path.to_path_buf())
    } else {
        normalize_path(base_dir.join(path))
    }
}

fn normalize_path(path: PathBuf) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}
