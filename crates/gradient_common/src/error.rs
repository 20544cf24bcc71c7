//! Error types for toolbox acquisition, diagnostic execution and summarization.
//!
//! Acquisition and resolution errors abort the whole run. Execution errors stay
//! local to one diagnostic. Summary errors only affect the summary section.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised while fetching, unpacking or resolving the toolbox.
#[derive(Error, Debug)]
pub enum ToolboxError {
    #[error("toolbox source unavailable: {locator}: {reason}")]
    SourceUnavailable { locator: String, reason: String },

    #[error("toolbox extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("archive entry escapes the working directory: {entry}")]
    PathTraversal { entry: String },

    #[error("unsupported archive entry type {kind} for {entry}")]
    UnsupportedEntryType { entry: String, kind: String },

    #[error("command '{command}' is empty")]
    EmptyCommand { command: String },

    #[error("binary for command '{binary}' not found in toolbox nix store")]
    BinaryNotFound { binary: String },

    #[error("playbook error at {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("config error at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("toolbox acquisition cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolboxError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolboxError::SourceUnavailable { .. } => "source_unavailable",
            ToolboxError::ExtractionFailed(_) => "extraction_failed",
            ToolboxError::PathTraversal { .. } => "path_traversal",
            ToolboxError::UnsupportedEntryType { .. } => "unsupported_entry_type",
            ToolboxError::EmptyCommand { .. } => "empty_command",
            ToolboxError::BinaryNotFound { .. } => "binary_not_found",
            ToolboxError::Manifest { .. } => "manifest",
            ToolboxError::Config { .. } => "config",
            ToolboxError::Cancelled => "cancelled",
            ToolboxError::Io(_) => "io",
        }
    }

    pub(crate) fn extraction(context: &str, err: impl std::fmt::Display) -> Self {
        ToolboxError::ExtractionFailed(format!("{}: {}", context, err))
    }
}

/// Errors local to a single diagnostic execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("binary for command '{command}' not found in toolbox nix store")]
    CommandNotResolved { command: String },

    #[error("command '{description}' failed: {exit}\nOutput: {output}")]
    CommandFailed {
        description: String,
        exit: String,
        output: String,
    },
}

impl ExecError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::CommandNotResolved { .. } => "command_not_resolved",
            ExecError::CommandFailed { .. } => "command_failed",
        }
    }
}

/// Errors from the summarization collaborator.
#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("no summarization provider configured")]
    ProviderUnavailable,

    #[error("no choices from LLM")]
    NoChoicesReturned,

    #[error("system_prompt is required in playbook")]
    MissingInstruction,

    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("summary task failed: {0}")]
    TaskFailed(String),
}

impl SummaryError {
    pub fn code(&self) -> &'static str {
        match self {
            SummaryError::ProviderUnavailable => "provider_unavailable",
            SummaryError::NoChoicesReturned => "no_choices",
            SummaryError::MissingInstruction => "missing_instruction",
            SummaryError::Transport(_) => "transport",
            SummaryError::Api { .. } => "api",
            SummaryError::TaskFailed(_) => "task_failed",
        }
    }
}
