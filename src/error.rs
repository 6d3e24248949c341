use std::path::PathBuf;

use anyhow::Error;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error as ThisError;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, ThisError)]
pub enum PipelineError {
    #[error("invalid tutorial: {message}")]
    Config { message: String },

    #[error("subshell '{name}' is already running")]
    DuplicateShell { name: String },

    #[error("no running subshell named '{name}'")]
    UnknownShell { name: String },

    #[error("subshell '{name}' failed: {reason}")]
    Shell { name: String, reason: String },

    #[error("failed to render {what}: {reason}")]
    Render { what: String, reason: String },

    #[error("failed to assemble {}: {reason}", output.display())]
    Assembly { output: PathBuf, reason: String },

    #[error("command #{index} ({kind}) failed: {source}")]
    Command {
        index: usize,
        kind: &'static str,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wraps an adapter failure, keeping its whole context chain as the reason.
    pub fn render(what: impl Into<String>, error: &Error) -> Self {
        Self::Render {
            what: what.into(),
            reason: format!("{error:#}"),
        }
    }

    pub fn assembly(output: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Assembly {
            output: output.into(),
            reason: reason.into(),
        }
    }

    pub fn at_command(self, index: usize, kind: &'static str) -> Self {
        Self::Command {
            index,
            kind,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping command wrappers.
    pub fn root(&self) -> &PipelineError {
        match self {
            Self::Command { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn command_index(&self) -> Option<usize> {
        match self {
            Self::Command { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Command { source, .. } => source.code(),
            Self::Config { .. } => "config_error",
            Self::DuplicateShell { .. } => "duplicate_shell",
            Self::UnknownShell { .. } => "unknown_shell",
            Self::Shell { .. } => "shell_error",
            Self::Render { .. } => "render_error",
            Self::Assembly { .. } => "assembly_error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Self::Config { .. } => 2,
            _ => 1,
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Command { index, kind, .. } => Some(json!({
                "command_index": index,
                "command_type": kind,
            })),
            Self::DuplicateShell { name } | Self::UnknownShell { name } => {
                Some(json!({ "subshell": name }))
            }
            Self::Assembly { output, .. } => Some(json!({ "output": output })),
            _ => None,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code().to_owned(),
                message: self.to_string(),
                details: self.details(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn find_pipeline_error(error: &Error) -> Option<&PipelineError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}
