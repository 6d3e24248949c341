use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::PipelineResult;
use crate::render::{Segment, SegmentRenderer};
use crate::shell::{ExecMode, ShellRegistry};
use crate::tutorial::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InterpreterState {
    Idle,
    Dispatching { index: usize },
    Done,
    Failed { index: usize },
}

/// Walks the command list once, in order, and stops at the first failure.
///
/// Segments rendered before a failure stay available through
/// [`Interpreter::segments`] so the caller can keep them for inspection.
pub struct Interpreter<'a> {
    renderer: &'a mut SegmentRenderer,
    registry: &'a mut ShellRegistry,
    state: InterpreterState,
    segments: Vec<Segment>,
}

impl<'a> Interpreter<'a> {
    pub fn new(renderer: &'a mut SegmentRenderer, registry: &'a mut ShellRegistry) -> Self {
        Self {
            renderer,
            registry,
            state: InterpreterState::Idle,
            segments: Vec::new(),
        }
    }

    pub fn state(&self) -> InterpreterState {
        self.state
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    pub fn run(&mut self, commands: &[Command]) -> PipelineResult<()> {
        for (index, command) in commands.iter().enumerate() {
            self.state = InterpreterState::Dispatching { index };
            if let Err(failure) = self.dispatch(index, command) {
                self.state = InterpreterState::Failed { index };
                let failure = failure.at_command(index, command.kind());
                error!(index, kind = command.kind(), error = %failure, "command failed");
                return Err(failure);
            }
        }
        self.state = InterpreterState::Done;
        info!(
            commands = commands.len(),
            segments = self.segments.len(),
            "all commands processed"
        );
        Ok(())
    }

    fn dispatch(&mut self, index: usize, command: &Command) -> PipelineResult<()> {
        debug!(index, kind = command.kind(), "dispatching");
        match command {
            Command::StartSubshell { name } => self.registry.start(name)?,
            Command::ExecuteSubshell(execute) => {
                let mode = if execute.is_detached() {
                    ExecMode::Detached
                } else {
                    ExecMode::Wait
                };
                self.registry.execute(
                    &execute.subshell_name,
                    &execute.command,
                    mode,
                    execute.expect.as_deref(),
                )?;
            }
            Command::TerminateSubshell { name } => self.registry.terminate(name)?,
            Command::CodeAnimationGenerator { .. } | Command::BrowserInteraction { .. } => {}
        }

        // Registry work happens first so a typed execute segment is only
        // produced for a command that actually ran.
        if let Some(segment) = self.renderer.render_command(index, command)? {
            self.segments.push(segment);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::render::fakes::{renderer, FakeAnimation, FakeBrowser};
    use crate::settings::ShellSegments;
    use crate::shell::ShellOptions;
    use crate::tutorial::parse_tutorial;

    fn registry() -> ShellRegistry {
        ShellRegistry::new(ShellOptions::new("sh"))
    }

    fn commands(json: &str) -> Vec<Command> {
        parse_tutorial(json).expect("valid tutorial").commands
    }

    #[test]
    fn animation_only_tutorial_yields_one_segment_per_command_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation::default(),
            FakeBrowser::default(),
            ShellSegments::None,
        );
        let mut registry = registry();
        let commands = commands(
            r#"{"output_video_name":"o.mp4","commands":[
                {"type":"CodeAnimationGenerator","text_mapping":[{"narration_text":"one","code_text":["a"]}]},
                {"type":"CodeAnimationGenerator","text_mapping":[{"narration_text":"two","code_text":["b"]}]},
                {"type":"CodeAnimationGenerator","text_mapping":[{"narration_text":"three","code_text":["c"]}]}
            ]}"#,
        );

        let mut interpreter = Interpreter::new(&mut renderer, &mut registry);
        interpreter.run(&commands).expect("run");
        assert_eq!(interpreter.state(), InterpreterState::Done);
        let indexes = interpreter
            .segments()
            .iter()
            .map(|segment| segment.source_command_index)
            .collect::<Vec<_>>();
        assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn shell_lifecycle_with_browser_produces_only_the_browser_segment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let browser = FakeBrowser::default();
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation::default(),
            browser.clone(),
            ShellSegments::None,
        );
        let mut registry = registry();
        let commands = commands(
            r#"{"output_video_name":"o.mp4","commands":[
                {"type":"StartSubshell","name":"s"},
                {"type":"ExecuteSubshell","subshell_name":"s","command":"sleep 30 &"},
                {"type":"BrowserInteraction","url":"http://localhost:5000/"},
                {"type":"TerminateSubshell","name":"s"}
            ]}"#,
        );

        let mut interpreter = Interpreter::new(&mut renderer, &mut registry);
        interpreter.run(&commands).expect("run");
        let segments = interpreter.into_segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].source_command_index, Some(2));
        assert_eq!(browser.urls.lock().expect("lock").len(), 1);
        assert!(registry.live_names().is_empty());
    }

    #[test]
    fn execute_against_unknown_shell_fails_at_its_index_with_no_segments() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation::default(),
            FakeBrowser::default(),
            ShellSegments::Typed,
        );
        let mut registry = registry();
        let commands = commands(
            r#"{"output_video_name":"o.mp4","commands":[
                {"type":"ExecuteSubshell","subshell_name":"missing","command":"ls"},
                {"type":"CodeAnimationGenerator","text_mapping":[{"narration_text":"x","code_text":["y"]}]}
            ]}"#,
        );

        let mut interpreter = Interpreter::new(&mut renderer, &mut registry);
        let error = interpreter.run(&commands).expect_err("unknown shell");
        assert_eq!(error.code(), "unknown_shell");
        assert_eq!(interpreter.state(), InterpreterState::Failed { index: 0 });
        assert!(interpreter.segments().is_empty());
        let envelope = serde_json::to_value(error.envelope()).expect("envelope");
        assert_eq!(envelope["error"]["details"]["command_index"], 0);
    }

    #[test]
    fn duplicate_start_fails_and_keeps_earlier_segments() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation::default(),
            FakeBrowser::default(),
            ShellSegments::None,
        );
        let mut registry = registry();
        let commands = commands(
            r#"{"output_video_name":"o.mp4","commands":[
                {"type":"CodeAnimationGenerator","text_mapping":[{"narration_text":"x","code_text":["y"]}]},
                {"type":"StartSubshell","name":"s"},
                {"type":"StartSubshell","name":"s"},
                {"type":"CodeAnimationGenerator","text_mapping":[{"narration_text":"never","code_text":["z"]}]}
            ]}"#,
        );

        let mut interpreter = Interpreter::new(&mut renderer, &mut registry);
        let error = interpreter.run(&commands).expect_err("duplicate");
        assert_eq!(error.code(), "duplicate_shell");
        assert_eq!(interpreter.state(), InterpreterState::Failed { index: 2 });
        assert_eq!(interpreter.segments().len(), 1);
        assert!(interpreter.segments()[0].path.exists());

        drop(interpreter);
        assert_eq!(registry.terminate_all(), 1);
    }

    #[test]
    fn typed_policy_adds_execute_segments_but_not_lifecycle_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut renderer = renderer(
            temp.path(),
            FakeAnimation::default(),
            FakeBrowser::default(),
            ShellSegments::Typed,
        );
        let mut registry = registry();
        let commands = commands(
            r#"{"output_video_name":"o.mp4","commands":[
                {"type":"StartSubshell","name":"s"},
                {"type":"ExecuteSubshell","subshell_name":"s","command":"true"},
                {"type":"TerminateSubshell","name":"s"}
            ]}"#,
        );

        let mut interpreter = Interpreter::new(&mut renderer, &mut registry);
        interpreter.run(&commands).expect("run");
        let indexes = interpreter
            .segments()
            .iter()
            .map(|segment| segment.source_command_index)
            .collect::<Vec<_>>();
        assert_eq!(indexes, vec![Some(1)]);
    }
}
