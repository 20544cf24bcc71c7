//! Sandbox wrapper invocation.
//!
//! Resolved binaries run through the bundled proot, which presents the
//! toolbox's nix directory at `/nix`. This module only builds the prefix
//! tokens; it never launches anything.

use std::path::{Path, PathBuf};

use crate::bundle::Bundle;

/// Mount point of the package store inside the sandbox
pub const SANDBOX_NIX_MOUNT: &str = "/nix";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    wrapper: PathBuf,
    nix_dir: PathBuf,
}

impl Sandbox {
    pub fn new(wrapper: impl Into<PathBuf>, nix_dir: impl Into<PathBuf>) -> Self {
        Self {
            wrapper: wrapper.into(),
            nix_dir: nix_dir.into(),
        }
    }

    pub fn for_bundle(bundle: &Bundle) -> Self {
        Self::new(bundle.sandbox_path(), bundle.nix_dir())
    }

    pub fn wrapper(&self) -> &Path {
        &self.wrapper
    }

    /// `<wrapper> -b <nix_dir>:/nix`
    pub fn prefix(&self) -> Vec<String> {
        vec![
            self.wrapper.display().to_string(),
            "-b".to_string(),
            format!("{}:{}", self.nix_dir.display(), SANDBOX_NIX_MOUNT),
        ]
    }

    /// Full invocation for a resolved binary, joined by single spaces
    pub fn wrap(&self, binary: &Path, args: &[&str]) -> String {
        let mut tokens = self.prefix();
        tokens.push(binary.display().to_string());
        tokens.extend(args.iter().map(|a| a.to_string()));
        tokens.join(" ")
    }
}
