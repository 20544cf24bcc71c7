//! Playbook manifest - the declarative diagnostic list shipped inside a toolbox.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ToolboxError;

/// Nix package source the toolbox was built from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NixpkgsSource {
    /// nixpkgs commit the packages are pinned to (empty = registry alias)
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub packages: Vec<String>,
}

/// One declared diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSpec {
    /// Command line template, split on whitespace
    pub command: String,

    /// Human-readable label
    #[serde(default)]
    pub description: String,

    /// Per-diagnostic timeout override; zero or absent uses the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

/// Parsed playbook.yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,

    #[serde(default)]
    pub nixpkgs: NixpkgsSource,

    /// Instruction handed to the summarizer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub commands: Vec<DiagnosticSpec>,
}

impl Playbook {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn from_path(path: &Path) -> Result<Self, ToolboxError> {
        let content = fs::read_to_string(path).map_err(|e| ToolboxError::Manifest {
            path: path.to_path_buf(),
            reason: format!("failed to read playbook: {}", e),
        })?;
        Self::from_yaml(&content).map_err(|e| ToolboxError::Manifest {
            path: path.to_path_buf(),
            reason: format!("failed to parse playbook: {}", e),
        })
    }

    /// Summarization instruction, if one is set and not blank
    pub fn instruction(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
    }
}
