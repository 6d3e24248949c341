use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::settings::{NarrationSettings, TerminalSettings};
use crate::tutorial::{TextMapping, ESCAPE_TOKEN};

const VHS_DELIMITERS: [char; 3] = ['"', '\'', '`'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", content = "value", rename_all = "snake_case")]
pub enum TypingStep {
    Type(String),
    Enter,
    Escape,
    Sleep(Duration),
}

/// Keystrokes and pauses handed to the terminal animation renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypingScript {
    steps: Vec<TypingStep>,
}

/// Rough speaking time for `text` at a fixed reading rate.
pub fn estimate_narration(text: &str, words_per_minute: u32) -> Duration {
    let words = text.split_whitespace().count() as u64;
    Duration::from_millis(words * 60_000 / u64::from(words_per_minute.max(1)))
}

impl TypingScript {
    pub fn from_text_mapping(mapping: &[TextMapping], narration: &NarrationSettings) -> Self {
        let mut script = Self::default();
        for entry in mapping {
            for line in entry.code_text.lines() {
                script.push_line(&line);
            }
            script.pause(estimate_narration(
                &entry.narration_text,
                narration.words_per_minute,
            ));
            script.pause(narration.settle);
        }
        script
    }

    /// Intro/outro code: typed as-is with no narration pacing.
    pub fn from_raw_lines(lines: &[String], settle: Duration) -> Self {
        let mut script = Self::default();
        for line in lines {
            script.push_line(line);
        }
        script.pause(settle);
        script
    }

    /// A subshell command shown being typed, without running it.
    pub fn typed_command(command: &str, settle: Duration) -> Self {
        let mut script = Self::default();
        script.steps.push(TypingStep::Type(command.to_owned()));
        script.pause(settle);
        script
    }

    pub fn steps(&self) -> &[TypingStep] {
        &self.steps
    }

    pub fn total_pause(&self) -> Duration {
        self.steps
            .iter()
            .map(|step| match step {
                TypingStep::Sleep(duration) => *duration,
                _ => Duration::ZERO,
            })
            .sum()
    }

    fn push_line(&mut self, line: &str) {
        if line == ESCAPE_TOKEN {
            self.steps.push(TypingStep::Escape);
            return;
        }
        if !line.is_empty() {
            self.steps.push(TypingStep::Type(line.to_owned()));
        }
        self.steps.push(TypingStep::Enter);
    }

    fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            self.steps.push(TypingStep::Sleep(duration));
        }
    }

    /// Renders the script as a VHS tape writing its recording to `output`.
    pub fn to_vhs_tape(&self, output: &Path, terminal: &TerminalSettings) -> String {
        let mut tape = String::new();
        for line in type_commands("Output", &output.to_string_lossy()) {
            tape.push_str(&line);
            tape.push('\n');
        }
        let _ = writeln!(tape, "Set FontSize {}", terminal.font_size);
        let _ = writeln!(tape, "Set Width {}", terminal.width);
        let _ = writeln!(tape, "Set Height {}", terminal.height);
        let _ = writeln!(tape, "Set TypingSpeed {}ms", terminal.typing_speed_ms);
        for line in type_commands("Set Theme", &terminal.theme) {
            tape.push_str(&line);
            tape.push('\n');
        }
        tape.push('\n');

        for step in &self.steps {
            match step {
                TypingStep::Type(text) => {
                    for line in type_commands("Type", text) {
                        tape.push_str(&line);
                        tape.push('\n');
                    }
                }
                TypingStep::Enter => tape.push_str("Enter\n"),
                TypingStep::Escape => tape.push_str("Escape\n"),
                TypingStep::Sleep(duration) => {
                    let _ = writeln!(tape, "Sleep {}ms", duration.as_millis());
                }
            }
        }
        tape
    }
}

/// VHS strings have no escapes, only a choice of delimiter. Text that uses
/// all of them is split across several commands.
fn type_commands(keyword: &str, text: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut chunk = String::new();
    let mut usable = VHS_DELIMITERS.to_vec();

    for c in text.chars() {
        let remaining = usable
            .iter()
            .copied()
            .filter(|delimiter| *delimiter != c)
            .collect::<Vec<_>>();
        if remaining.is_empty() {
            commands.push(quoted(keyword, &chunk, usable[0]));
            chunk.clear();
            usable = VHS_DELIMITERS.iter().copied().filter(|d| *d != c).collect();
        } else {
            usable = remaining;
        }
        chunk.push(c);
    }
    commands.push(quoted(keyword, &chunk, usable[0]));
    commands
}

fn quoted(keyword: &str, text: &str, delimiter: char) -> String {
    format!("{keyword} {delimiter}{text}{delimiter}")
}
