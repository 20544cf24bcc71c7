//! Bundle - an extracted toolbox and the working directory that owns it.
//!
//! Layout inside the working directory:
//!
//! ```text
//! toolbox/
//!   nix/store/<hash>-<pkg>/{bin,sbin}/...   package store
//!   proot                                     sandbox wrapper
//!   playbook.yaml                             diagnostics manifest
//! ```
//!
//! The working directory is removed when the bundle is dropped or cleaned up.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::error::ToolboxError;
use crate::extract::ArchiveExtractor;
use crate::fetch::ArchiveFetcher;
use crate::playbook::Playbook;

/// Top-level directory every toolbox archive unpacks into
pub const TOOLBOX_DIR: &str = "toolbox";

/// Manifest location relative to the toolbox directory
pub const PLAYBOOK_FILE: &str = "playbook.yaml";

/// Sandbox wrapper location relative to the toolbox directory
pub const SANDBOX_BIN: &str = "proot";

/// Working directory name prefix
const WORKDIR_PREFIX: &str = "toolbox_";

#[derive(Debug)]
pub struct Bundle {
    workdir: TempDir,
    playbook: Playbook,
}

impl Bundle {
    /// Fetch, unpack and load a toolbox.
    ///
    /// Blocking. On any failure the partially written working directory is
    /// removed before the error is returned.
    pub fn acquire(locator: &str) -> Result<Self, ToolboxError> {
        Self::acquire_cancellable(locator, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`Bundle::acquire`], giving up between archive entries once `cancel` is set
    pub fn acquire_cancellable(
        locator: &str,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, ToolboxError> {
        let workdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(temp_dir_base())
            .map_err(|e| ToolboxError::extraction("failed to create temp directory", e))?;

        let fetcher = ArchiveFetcher::new(locator);
        let stream = fetcher.open()?;
        ArchiveExtractor::new(workdir.path())
            .with_cancel(cancel)
            .extract(stream)?;

        Self::open(workdir)
    }

    /// Wrap an already-populated working directory and load its manifest
    pub fn open(workdir: TempDir) -> Result<Self, ToolboxError> {
        let path = workdir.path().join(TOOLBOX_DIR).join(PLAYBOOK_FILE);
        let playbook = Playbook::from_path(&path)?;
        info!(
            root = %workdir.path().display(),
            playbook = %playbook.id,
            diagnostics = playbook.commands.len(),
            "Toolbox ready"
        );
        Ok(Self { workdir, playbook })
    }

    /// Working directory root; diagnostics run with this as cwd
    pub fn root(&self) -> &Path {
        self.workdir.path()
    }

    pub fn toolbox_dir(&self) -> PathBuf {
        self.root().join(TOOLBOX_DIR)
    }

    /// Directory bound to /nix inside the sandbox
    pub fn nix_dir(&self) -> PathBuf {
        self.toolbox_dir().join("nix")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.nix_dir().join("store")
    }

    pub fn sandbox_path(&self) -> PathBuf {
        self.toolbox_dir().join(SANDBOX_BIN)
    }

    pub fn playbook(&self) -> &Playbook {
        &self.playbook
    }

    /// Remove the working directory now, reporting failures
    pub fn cleanup(self) -> Result<(), ToolboxError> {
        let root = self.root().to_path_buf();
        match self.workdir.close() {
            Ok(()) => {
                info!("Removed toolbox directory {}", root.display());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to remove toolbox directory {}: {}", root.display(), e);
                Err(ToolboxError::Io(e))
            }
        }
    }
}

/// Base for temp directories; never relative to the current directory
fn temp_dir_base() -> PathBuf {
    let t = std::env::temp_dir();
    if t.is_absolute() {
        t
    } else {
        PathBuf::from("/tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workdir_with_playbook(yaml: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let toolbox = dir.path().join(TOOLBOX_DIR);
        fs::create_dir_all(&toolbox).unwrap();
        fs::write(toolbox.join(PLAYBOOK_FILE), yaml).unwrap();
        dir
    }

    #[test]
    fn test_open_loads_playbook_and_layout() {
        let dir = workdir_with_playbook("id: demo\ncommands:\n  - command: uptime\n");
        let bundle = Bundle::open(dir).unwrap();
        assert_eq!(bundle.playbook().id, "demo");
        assert!(bundle.store_dir().ends_with("toolbox/nix/store"));
        assert!(bundle.sandbox_path().ends_with("toolbox/proot"));
    }

    #[test]
    fn test_cleanup_removes_workdir() {
        let dir = workdir_with_playbook("id: demo\n");
        let bundle = Bundle::open(dir).unwrap();
        let root = bundle.root().to_path_buf();
        bundle.cleanup().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_playbook_is_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Bundle::open(dir).unwrap_err();
        assert_eq!(err.code(), "manifest");
    }

    #[test]
    fn test_cancelled_acquire_fails() {
        let src = workdir_with_playbook("id: demo\n");
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("demo.linux.amd64.tar.xz");
        let file = fs::File::create(&archive).unwrap();
        crate::pack::pack_dir(&src.path().join(TOOLBOX_DIR), TOOLBOX_DIR, file).unwrap();

        let err = Bundle::acquire_cancellable(
            archive.to_str().unwrap(),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap_err();
        assert_eq!(err.code(), "cancelled");

        let bundle = Bundle::acquire(archive.to_str().unwrap()).unwrap();
        assert_eq!(bundle.playbook().id, "demo");
    }

    #[test]
    fn test_acquire_missing_archive_fails() {
        let err = Bundle::acquire("file:///definitely/not/here.tar.xz").unwrap_err();
        assert_eq!(err.code(), "source_unavailable");
    }
}
