use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{PipelineError, PipelineResult};

/// Reserved code line that is sent as an editor escape keystroke.
pub const ESCAPE_TOKEN: &str = "<Escape>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMapping {
    #[serde(default)]
    pub narration_text: String,
    pub code_text: CodeText,
}

/// Either an array of lines or a single newline-separated block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodeText {
    Lines(Vec<String>),
    Block(String),
}

impl CodeText {
    pub fn lines(&self) -> Vec<String> {
        match self {
            CodeText::Lines(lines) => lines
                .iter()
                .flat_map(|line| line.split('\n'))
                .map(str::to_owned)
                .collect(),
            CodeText::Block(block) => block
                .trim_matches('\n')
                .split('\n')
                .map(str::to_owned)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSubshell {
    pub subshell_name: String,
    pub command: String,
    /// Fire-and-forget. Filled in at load time when the file leaves it out.
    #[serde(default)]
    pub detached: Option<bool>,
    #[serde(default)]
    pub expect: Option<String>,
}

impl ExecuteSubshell {
    pub fn is_detached(&self) -> bool {
        self.detached.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    CodeAnimationGenerator {
        text_mapping: Vec<TextMapping>,
    },
    StartSubshell {
        name: String,
    },
    ExecuteSubshell(ExecuteSubshell),
    TerminateSubshell {
        name: String,
    },
    BrowserInteraction {
        url: String,
        #[serde(default)]
        text: String,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CodeAnimationGenerator { .. } => "CodeAnimationGenerator",
            Command::StartSubshell { .. } => "StartSubshell",
            Command::ExecuteSubshell(_) => "ExecuteSubshell",
            Command::TerminateSubshell { .. } => "TerminateSubshell",
            Command::BrowserInteraction { .. } => "BrowserInteraction",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroOutro {
    #[serde(default)]
    pub intro_code: Vec<String>,
    #[serde(default)]
    pub outro_code: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TutorialFile {
    commands: Vec<Value>,
    output_video_name: String,
    #[serde(default)]
    intro_outro: Option<IntroOutro>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tutorial {
    pub commands: Vec<Command>,
    pub output_video_name: PathBuf,
    pub intro_outro: IntroOutro,
}

pub fn load_tutorial(path: &Path) -> PipelineResult<Tutorial> {
    let contents = fs::read_to_string(path).map_err(|error| {
        PipelineError::config(format!("failed to read {}: {error}", path.display()))
    })?;
    parse_tutorial(&contents).map_err(|error| match error {
        PipelineError::Config { message } => {
            PipelineError::config(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

pub fn parse_tutorial(contents: &str) -> PipelineResult<Tutorial> {
    let file: TutorialFile = serde_json::from_str(contents).map_err(|error| {
        PipelineError::config(format!(
            "failed to parse json at line {}, column {}: {error}",
            error.line(),
            error.column()
        ))
    })?;

    let mut commands = Vec::with_capacity(file.commands.len());
    for (index, raw) in file.commands.into_iter().enumerate() {
        let mut command: Command = serde_json::from_value(raw)
            .map_err(|error| PipelineError::config(format!("commands[{index}]: {error}")))?;
        validate_command(&mut command)
            .map_err(|message| PipelineError::config(format!("commands[{index}]: {message}")))?;
        commands.push(command);
    }

    let output_video_name = file.output_video_name.trim();
    if output_video_name.is_empty() {
        return Err(PipelineError::config("output_video_name must not be empty"));
    }

    Ok(Tutorial {
        commands,
        output_video_name: PathBuf::from(output_video_name),
        intro_outro: file.intro_outro.unwrap_or_default(),
    })
}

fn validate_command(command: &mut Command) -> Result<(), String> {
    match command {
        Command::CodeAnimationGenerator { text_mapping } => {
            if text_mapping.is_empty() {
                return Err(String::from("text_mapping must not be empty"));
            }
        }
        Command::StartSubshell { name } | Command::TerminateSubshell { name } => {
            require_name(name)?;
        }
        Command::ExecuteSubshell(execute) => {
            require_name(&execute.subshell_name)?;
            if execute.command.trim().is_empty() {
                return Err(String::from("command must not be empty"));
            }
            if execute.detached.is_none() {
                execute.detached = Some(has_background_operator(&execute.command));
            }
        }
        Command::BrowserInteraction { url, .. } => {
            let parsed = Url::parse(url).map_err(|error| format!("invalid url '{url}': {error}"))?;
            if !matches!(parsed.scheme(), "http" | "https" | "file") {
                return Err(format!("unsupported url scheme '{}'", parsed.scheme()));
            }
        }
    }
    Ok(())
}

fn require_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err(String::from("subshell name must not be empty"));
    }
    Ok(())
}

/// A lone trailing `&`, not the tail of `&&`.
pub fn has_background_operator(command: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"(^|[^&])&\s*$").expect("static regex"));
    pattern.is_match(command)
}

/// Shell references that can never succeed given the declaration order.
pub fn lint_shell_order(tutorial: &Tutorial) -> Vec<String> {
    let mut live = HashSet::new();
    let mut warnings = Vec::new();
    for (index, command) in tutorial.commands.iter().enumerate() {
        match command {
            Command::StartSubshell { name } => {
                if !live.insert(name.as_str()) {
                    warnings.push(format!(
                        "commands[{index}]: subshell '{name}' is started while already running"
                    ));
                }
            }
            Command::ExecuteSubshell(execute) => {
                if !live.contains(execute.subshell_name.as_str()) {
                    warnings.push(format!(
                        "commands[{index}]: subshell '{}' is not running here",
                        execute.subshell_name
                    ));
                }
            }
            Command::TerminateSubshell { name } => {
                if !live.remove(name.as_str()) {
                    warnings.push(format!(
                        "commands[{index}]: subshell '{name}' is not running here"
                    ));
                }
            }
            Command::CodeAnimationGenerator { .. } | Command::BrowserInteraction { .. } => {}
        }
    }
    for name in live {
        warnings.push(format!(
            "subshell '{name}' is never terminated (it will be stopped at teardown)"
        ));
    }
    warnings.sort();
    warnings
}
