use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::process::run_tool;
use crate::settings::{
    BrowserSettings, NarrationSettings, Settings, ShellSegments, TerminalSettings,
};
use crate::tutorial::Command;
use crate::typing::{estimate_narration, TypingScript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentRole {
    Intro,
    Command,
    Outro,
}

/// One rendered clip. `ordering_key` is its position in the final video and is
/// assigned when the assembly order is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub role: SegmentRole,
    pub source_command_index: Option<usize>,
    pub path: PathBuf,
    pub ordering_key: usize,
}

/// Turns a typing script into a terminal recording.
pub trait AnimationBackend {
    fn label(&self) -> &'static str;
    fn render(&self, script: &TypingScript, output: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BrowserCapture<'a> {
    pub url: &'a str,
    pub text: &'a str,
    pub duration: Duration,
}

/// Opens a page and records it for a while.
pub trait BrowserBackend {
    fn label(&self) -> &'static str;
    fn record(&self, capture: &BrowserCapture<'_>, output: &Path) -> Result<()>;
}

pub struct VhsBackend {
    terminal: TerminalSettings,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
}

impl VhsBackend {
    pub fn new(
        terminal: TerminalSettings,
        timeout: Option<Duration>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            terminal,
            timeout,
            env,
        }
    }
}

impl AnimationBackend for VhsBackend {
    fn label(&self) -> &'static str {
        "vhs"
    }

    fn render(&self, script: &TypingScript, output: &Path) -> Result<()> {
        let tape_path = output.with_extension("tape");
        let tape = script.to_vhs_tape(output, &self.terminal);
        fs::write(&tape_path, tape)
            .with_context(|| format!("failed to write tape {}", tape_path.display()))?;

        let mut command = ProcessCommand::new(&self.terminal.vhs_binary);
        command.arg(&tape_path).envs(&self.env);
        run_tool(self.label(), &mut command, self.timeout)?;
        Ok(())
    }
}

/// Runs a configured recorder command built from an argv template.
pub struct CommandBrowserBackend {
    settings: BrowserSettings,
    width: u32,
    height: u32,
    env: BTreeMap<String, String>,
}

impl CommandBrowserBackend {
    pub fn new(
        settings: BrowserSettings,
        width: u32,
        height: u32,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            settings,
            width,
            height,
            env,
        }
    }

    pub fn argv(&self, capture: &BrowserCapture<'_>, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        let width = self.width.to_string();
        let height = self.height.to_string();
        let duration_ms = capture.duration.as_millis().to_string();
        let timeout_ms = self.settings.timeout.as_millis().to_string();
        let value_of = |name: &str| match name {
            "url" => Some(capture.url),
            "output" => Some(&*output),
            "width" => Some(width.as_str()),
            "height" => Some(height.as_str()),
            "duration_ms" => Some(duration_ms.as_str()),
            "timeout_ms" => Some(timeout_ms.as_str()),
            "text" => Some(capture.text),
            _ => None,
        };
        self.settings
            .command
            .iter()
            .map(|arg| fill_template(arg, value_of))
            .collect()
    }
}

/// Substitutes `{name}` placeholders in one left-to-right pass. Substituted
/// values are never rescanned; unknown names are left as written.
fn fill_template<'v>(template: &str, value_of: impl Fn(&str) -> Option<&'v str>) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        filled.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after
            .find('}')
            .and_then(|close| value_of(&after[..close]).map(|value| (close, value)))
        {
            Some((close, value)) => {
                filled.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                filled.push('{');
                rest = after;
            }
        }
    }
    filled.push_str(rest);
    filled
}

impl BrowserBackend for CommandBrowserBackend {
    fn label(&self) -> &'static str {
        "browser recorder"
    }

    fn record(&self, capture: &BrowserCapture<'_>, output: &Path) -> Result<()> {
        let argv = self.argv(capture, output);
        let Some((program, args)) = argv.split_first() else {
            bail!("browser.command is empty");
        };
        let mut command = ProcessCommand::new(program);
        command.args(args).envs(&self.env);
        // Navigation gets its own bound; the recording itself runs for `duration`.
        let timeout = self.settings.timeout + capture.duration;
        run_tool(self.label(), &mut command, Some(timeout))?;
        Ok(())
    }
}

pub struct SegmentRenderer {
    work_dir: PathBuf,
    narration: NarrationSettings,
    shell_segments: ShellSegments,
    animation: Box<dyn AnimationBackend>,
    browser: Box<dyn BrowserBackend>,
    next_file: usize,
}

impl SegmentRenderer {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        narration: NarrationSettings,
        shell_segments: ShellSegments,
        animation: Box<dyn AnimationBackend>,
        browser: Box<dyn BrowserBackend>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            narration,
            shell_segments,
            animation,
            browser,
            next_file: 0,
        }
    }

    pub fn from_settings(settings: &Settings, work_dir: impl Into<PathBuf>) -> Self {
        let animation = VhsBackend::new(
            settings.terminal.clone(),
            settings.render_timeout,
            settings.env.clone(),
        );
        let browser = CommandBrowserBackend::new(
            settings.browser.clone(),
            settings.terminal.width,
            settings.terminal.height,
            settings.env.clone(),
        );
        Self::new(
            work_dir,
            settings.narration.clone(),
            settings.shell_segments,
            Box::new(animation),
            Box::new(browser),
        )
    }

    /// Produces the segment for one command, or `None` for pure bookkeeping
    /// commands. Subshell commands never touch the registry from here.
    pub fn render_command(
        &mut self,
        index: usize,
        command: &Command,
    ) -> PipelineResult<Option<Segment>> {
        match command {
            Command::CodeAnimationGenerator { text_mapping } => {
                let script = TypingScript::from_text_mapping(text_mapping, &self.narration);
                self.render_script(SegmentRole::Command, Some(index), &script)
                    .map(Some)
            }
            Command::BrowserInteraction { url, text } => {
                let capture = BrowserCapture {
                    url,
                    text,
                    duration: estimate_narration(text, self.narration.words_per_minute)
                        .max(self.narration.settle),
                };
                self.record_browser(index, &capture).map(Some)
            }
            Command::ExecuteSubshell(execute) if self.shell_segments == ShellSegments::Typed => {
                let script = TypingScript::typed_command(&execute.command, self.narration.settle);
                self.render_script(SegmentRole::Command, Some(index), &script)
                    .map(Some)
            }
            Command::StartSubshell { .. }
            | Command::ExecuteSubshell(_)
            | Command::TerminateSubshell { .. } => Ok(None),
        }
    }

    /// Intro/outro lines are typed verbatim with no narration pauses.
    pub fn render_bookend(
        &mut self,
        role: SegmentRole,
        lines: &[String],
    ) -> PipelineResult<Option<Segment>> {
        if lines.is_empty() {
            return Ok(None);
        }
        let script = TypingScript::from_raw_lines(lines, self.narration.settle);
        self.render_script(role, None, &script).map(Some)
    }

    fn render_script(
        &mut self,
        role: SegmentRole,
        index: Option<usize>,
        script: &TypingScript,
    ) -> PipelineResult<Segment> {
        let path = self.next_path(role);
        let what = describe(role, index);
        debug!(
            segment = %path.display(),
            steps = script.steps().len(),
            pause_ms = script.total_pause().as_millis() as u64,
            "rendering typing script"
        );
        self.animation
            .render(script, &path)
            .and_then(|()| verify_output(&path))
            .map_err(|error| PipelineError::render(&what, &error))?;
        info!(segment = %path.display(), backend = self.animation.label(), "rendered {what}");
        Ok(Segment {
            role,
            source_command_index: index,
            path,
            ordering_key: 0,
        })
    }

    fn record_browser(
        &mut self,
        index: usize,
        capture: &BrowserCapture<'_>,
    ) -> PipelineResult<Segment> {
        let path = self.next_path(SegmentRole::Command);
        let what = format!("{} ({})", describe(SegmentRole::Command, Some(index)), capture.url);
        self.browser
            .record(capture, &path)
            .and_then(|()| verify_output(&path))
            .map_err(|error| PipelineError::render(&what, &error))?;
        info!(segment = %path.display(), backend = self.browser.label(), "rendered {what}");
        Ok(Segment {
            role: SegmentRole::Command,
            source_command_index: Some(index),
            path,
            ordering_key: 0,
        })
    }

    fn next_path(&mut self, role: SegmentRole) -> PathBuf {
        self.next_file += 1;
        let label = match role {
            SegmentRole::Intro => "intro",
            SegmentRole::Command => "command",
            SegmentRole::Outro => "outro",
        };
        self.work_dir
            .join(format!("segment_{:03}_{label}.mp4", self.next_file))
    }
}

fn describe(role: SegmentRole, index: Option<usize>) -> String {
    match (role, index) {
        (SegmentRole::Intro, _) => String::from("intro segment"),
        (SegmentRole::Outro, _) => String::from("outro segment"),
        (SegmentRole::Command, Some(index)) => format!("segment for command #{index}"),
        (SegmentRole::Command, None) => String::from("command segment"),
    }
}

fn verify_output(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("renderer produced no output file at {}", path.display()))?;
    if metadata.len() == 0 {
        bail!("renderer produced an empty file at {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;

    use super::*;

    /// Writes a placeholder clip and remembers every script it was given.
    #[derive(Clone, Default)]
    pub struct FakeAnimation {
        pub scripts: Arc<Mutex<Vec<(TypingScript, PathBuf)>>>,
        pub fail: bool,
        pub skip_output: bool,
    }

    impl AnimationBackend for FakeAnimation {
        fn label(&self) -> &'static str {
            "fake-animation"
        }

        fn render(&self, script: &TypingScript, output: &Path) -> Result<()> {
            if self.fail {
                return Err(anyhow!("vhs exited with status 1"));
            }
            if let Ok(mut scripts) = self.scripts.lock() {
                scripts.push((script.clone(), output.to_path_buf()));
            }
            if !self.skip_output {
                fs::write(output, b"animation")?;
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct FakeBrowser {
        pub urls: Arc<Mutex<Vec<String>>>,
        pub fail: bool,
    }

    impl BrowserBackend for FakeBrowser {
        fn label(&self) -> &'static str {
            "fake-browser"
        }

        fn record(&self, capture: &BrowserCapture<'_>, output: &Path) -> Result<()> {
            if self.fail {
                return Err(anyhow!("navigation to {} timed out", capture.url));
            }
            if let Ok(mut urls) = self.urls.lock() {
                urls.push(capture.url.to_owned());
            }
            fs::write(output, b"browser")?;
            Ok(())
        }
    }

    pub fn narration() -> NarrationSettings {
        NarrationSettings {
            words_per_minute: 150,
            settle: Duration::from_millis(500),
        }
    }

    pub fn renderer(
        work_dir: &Path,
        animation: FakeAnimation,
        browser: FakeBrowser,
        shell_segments: ShellSegments,
    ) -> SegmentRenderer {
        SegmentRenderer::new(
            work_dir,
            narration(),
            shell_segments,
            Box::new(animation),
            Box::new(browser),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::tutorial::{CodeText, ExecuteSubshell, TextMapping};
    use crate::typing::TypingStep;

    fn animation_command() -> Command {
        Command::CodeAnimationGenerator {
            text_mapping: vec![TextMapping {
                narration_text: String::from("Say hello."),
                code_text: CodeText::Lines(vec![String::from("echo hello")]),
            }],
        }
    }

    fn execute_command() -> Command {
        Command::ExecuteSubshell(ExecuteSubshell {
            subshell_name: String::from("s"),
            command: String::from("python3 -m http.server &"),
            detached: Some(true),
            expect: None,
        })
    }

    #[test]
    fn animation_command_renders_one_segment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let animation = FakeAnimation::default();
        let mut renderer = renderer(
            temp.path(),
            animation.clone(),
            FakeBrowser::default(),
            ShellSegments::None,
        );

        let segment = renderer
            .render_command(3, &animation_command())
            .expect("render")
            .expect("animation produces a segment");
        assert_eq!(segment.source_command_index, Some(3));
        assert_eq!(segment.role, SegmentRole::Command);
        assert!(segment.path.exists());

        let scripts = animation.scripts.lock().expect("lock");
        assert_eq!(scripts.len(), 1);
        assert_eq!(
            scripts[0].0.steps()[0],
            TypingStep::Type(String::from("echo hello"))
        );
    }

    #[test]
    fn shell_commands_produce_no_segment_by_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let animation = FakeAnimation::default();
        let mut renderer = renderer(
            temp.path(),
            animation.clone(),
            FakeBrowser::default(),
            ShellSegments::None,
        );
        let start = Command::StartSubshell {
            name: String::from("s"),
        };
        let stop = Command::TerminateSubshell {
            name: String::from("s"),
        };
        for command in [start, execute_command(), stop] {
            assert!(renderer.render_command(0, &command).expect("render").is_none());
        }
        assert!(animation.scripts.lock().expect("lock").is_empty());
    }

    #[test]
    fn typed_policy_renders_execute_without_enter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let animation = FakeAnimation::default();
        let mut renderer = renderer(
            temp.path(),
            animation.clone(),
            FakeBrowser::default(),
            ShellSegments::Typed,
        );
        let segment = renderer
            .render_command(1, &execute_command())
            .expect("render");
        assert!(segment.is_some());

        let scripts = animation.scripts.lock().expect("lock");
        assert!(!scripts[0].0.steps().contains(&TypingStep::Enter));
    }

    #[test]
    fn browser_command_records_the_url() {
        let temp = tempfile::tempdir().expect("tempdir");
        let browser = FakeBrowser::default();
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation::default(),
            browser.clone(),
            ShellSegments::None,
        );
        let command = Command::BrowserInteraction {
            url: String::from("http://localhost:5000/"),
            text: String::from("The page renders."),
        };
        let segment = renderer.render_command(4, &command).expect("render");
        assert!(segment.is_some());
        assert_eq!(
            *browser.urls.lock().expect("lock"),
            vec![String::from("http://localhost:5000/")]
        );
    }

    #[test]
    fn backend_failures_become_render_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation {
                fail: true,
                ..FakeAnimation::default()
            },
            FakeBrowser {
                fail: true,
                ..FakeBrowser::default()
            },
            ShellSegments::None,
        );
        let error = renderer
            .render_command(0, &animation_command())
            .expect_err("animation failure");
        assert_eq!(error.code(), "render_error");
        assert!(error.to_string().contains("vhs exited"));

        let command = Command::BrowserInteraction {
            url: String::from("http://localhost:1/"),
            text: String::new(),
        };
        let error = renderer
            .render_command(1, &command)
            .expect_err("browser failure");
        assert!(error.to_string().contains("timed out"));
    }

    #[test]
    fn missing_output_file_is_a_render_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation {
                skip_output: true,
                ..FakeAnimation::default()
            },
            FakeBrowser::default(),
            ShellSegments::None,
        );
        let error = renderer
            .render_command(0, &animation_command())
            .expect_err("no output file");
        assert!(error.to_string().contains("no output file"));
    }

    #[test]
    fn empty_bookends_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let animation = FakeAnimation::default();
        let mut renderer = renderer(
            temp.path(),
            animation.clone(),
            FakeBrowser::default(),
            ShellSegments::None,
        );
        assert!(renderer
            .render_bookend(SegmentRole::Intro, &[])
            .expect("empty intro")
            .is_none());
        let outro = renderer
            .render_bookend(SegmentRole::Outro, &[String::from("clear")])
            .expect("outro")
            .expect("outro segment");
        assert_eq!(outro.role, SegmentRole::Outro);
        assert_eq!(outro.source_command_index, None);
    }

    #[test]
    fn browser_argv_substitutes_placeholders() {
        let backend = CommandBrowserBackend::new(
            BrowserSettings {
                command: vec![
                    String::from("record"),
                    String::from("--url={url}"),
                    String::from("{output}"),
                    String::from("{width}x{height}"),
                    String::from("{duration_ms}"),
                    String::from("{text}"),
                ],
                timeout: Duration::from_secs(60),
            },
            1280,
            720,
            BTreeMap::new(),
        );
        let capture = BrowserCapture {
            url: "http://localhost:5000/",
            text: "Look here.",
            duration: Duration::from_millis(800),
        };
        let argv = backend.argv(&capture, Path::new("/work/segment_002_command.mp4"));
        assert_eq!(
            argv,
            vec![
                "record",
                "--url=http://localhost:5000/",
                "/work/segment_002_command.mp4",
                "1280x720",
                "800",
                "Look here."
            ]
        );
    }

    #[test]
    fn placeholders_inside_substituted_values_are_kept_literally() {
        let backend = CommandBrowserBackend::new(
            BrowserSettings {
                command: vec![
                    String::from("record"),
                    String::from("{url}"),
                    String::from("{text}|{unknown}|{output"),
                ],
                timeout: Duration::from_secs(60),
            },
            1280,
            720,
            BTreeMap::new(),
        );
        let capture = BrowserCapture {
            url: "http://localhost:5000/?q={text}&o={output}",
            text: "say {url}",
            duration: Duration::from_millis(800),
        };
        let argv = backend.argv(&capture, Path::new("/work/clip.mp4"));
        assert_eq!(
            argv,
            vec![
                "record",
                "http://localhost:5000/?q={text}&o={output}",
                "say {url}|{unknown}|{output",
            ]
        );
    }
}
