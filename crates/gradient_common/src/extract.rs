//! Toolbox archive extraction (xz-compressed tar).
//!
//! Every entry's target is checked against the working directory before any
//! filesystem mutation:
//! - `..`, absolute and prefix components are rejected
//! - an already-extracted symlink may not sit anywhere on the target path
//!
//! Directories get 0755, regular files keep their archive permission bits,
//! symlinks point at the archive-declared target verbatim.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tar::EntryType;
use tracing::{debug, info, trace};

use crate::error::ToolboxError;

/// Mode used for every created directory
const DIR_MODE: u32 = 0o755;

/// Permission bits kept from archive file modes (setuid/setgid/sticky dropped)
const FILE_MODE_MASK: u32 = 0o777;

/// Counters reported after a successful extraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub bytes: u64,
}

/// Unpacks an archive stream into a working directory
pub struct ArchiveExtractor {
    root: PathBuf,
    cancel: Option<Arc<AtomicBool>>,
}

impl ArchiveExtractor {
    /// `root` must already exist and be owned by the caller
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cancel: None,
        }
    }

    /// Stop with [`ToolboxError::Cancelled`] before the next entry once `flag` is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decompress and unpack an xz tar stream
    pub fn extract<R: Read>(&self, reader: R) -> Result<ExtractStats, ToolboxError> {
        let decoder = xz2::read::XzDecoder::new_multi_decoder(reader);
        self.extract_tar(decoder)
    }

    /// Unpack an uncompressed tar stream
    pub fn extract_tar<R: Read>(&self, reader: R) -> Result<ExtractStats, ToolboxError> {
        let mut archive = tar::Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|e| ToolboxError::extraction("failed to read tar header", e))?;

        let mut stats = ExtractStats::default();
        for entry in entries {
            if self.cancelled() {
                debug!(root = %self.root.display(), "Extraction cancelled");
                return Err(ToolboxError::Cancelled);
            }
            let mut entry =
                entry.map_err(|e| ToolboxError::extraction("failed to read tar header", e))?;
            self.unpack_entry(&mut entry, &mut stats)?;
        }

        info!(
            root = %self.root.display(),
            directories = stats.directories,
            files = stats.files,
            symlinks = stats.symlinks,
            bytes = stats.bytes,
            "Toolbox extracted"
        );
        Ok(stats)
    }

    fn unpack_entry<R: Read>(
        &self,
        entry: &mut tar::Entry<'_, R>,
        stats: &mut ExtractStats,
    ) -> Result<(), ToolboxError> {
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();

        // Archive-wide pax metadata, not a filesystem entry
        if entry_type == EntryType::XGlobalHeader {
            trace!(entry = %name, "Skipping pax global header");
            return Ok(());
        }

        let path = entry
            .path()
            .map_err(|e| ToolboxError::extraction("invalid entry path", e))?
            .into_owned();
        let target = self.contained_target(&path, &name)?;

        match entry_type {
            EntryType::Directory => {
                if target != self.root {
                    self.ensure_no_symlink(&target, &name)?;
                    create_dir(&target).map_err(|e| {
                        ToolboxError::extraction(
                            &format!("failed to create directory {}", target.display()),
                            e,
                        )
                    })?;
                }
                stats.directories += 1;
            }
            EntryType::Regular => {
                self.require_named(&target, &name)?;
                self.ensure_no_symlink(&target, &name)?;
                self.create_parent(&target)?;

                let mode = entry
                    .header()
                    .mode()
                    .map_err(|e| ToolboxError::extraction("invalid file mode", e))?
                    & FILE_MODE_MASK;

                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&target)
                    .map_err(|e| {
                        ToolboxError::extraction(
                            &format!("failed to create file {}", target.display()),
                            e,
                        )
                    })?;
                let copied = io::copy(entry, &mut file)
                    .map_err(|e| ToolboxError::extraction("failed to copy file content", e))?;
                // Open honours the umask; the archive's bits win.
                fs::set_permissions(&target, fs::Permissions::from_mode(mode)).map_err(|e| {
                    ToolboxError::extraction(
                        &format!("failed to set mode on {}", target.display()),
                        e,
                    )
                })?;

                stats.files += 1;
                stats.bytes += copied;
            }
            EntryType::Symlink => {
                self.require_named(&target, &name)?;
                self.ensure_no_symlink(&target, &name)?;
                self.create_parent(&target)?;

                let link = entry
                    .link_name()
                    .map_err(|e| ToolboxError::extraction("invalid symlink target", e))?
                    .ok_or_else(|| {
                        ToolboxError::ExtractionFailed(format!("symlink {} has no target", name))
                    })?;
                std::os::unix::fs::symlink(&link, &target).map_err(|e| {
                    ToolboxError::extraction(
                        &format!(
                            "failed to create symlink {} -> {}",
                            target.display(),
                            link.display()
                        ),
                        e,
                    )
                })?;
                stats.symlinks += 1;
            }
            other => {
                return Err(ToolboxError::UnsupportedEntryType {
                    entry: name,
                    kind: format!("{:?} ({})", other, other.as_byte() as char),
                });
            }
        }

        debug!(entry = %name, kind = ?entry_type, "Unpacked entry");
        Ok(())
    }

    /// Join an entry name onto the root, refusing anything that leaves it
    fn contained_target(&self, path: &Path, name: &str) -> Result<PathBuf, ToolboxError> {
        let mut target = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => target.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ToolboxError::PathTraversal {
                        entry: name.to_string(),
                    });
                }
            }
        }
        Ok(target)
    }

    /// Files and links need a name below the root, not the root itself
    fn require_named(&self, target: &Path, name: &str) -> Result<(), ToolboxError> {
        if target == self.root {
            return Err(ToolboxError::ExtractionFailed(format!(
                "entry '{}' has no file name",
                name
            )));
        }
        Ok(())
    }

    /// Reject targets reached through a symlink written by an earlier entry
    fn ensure_no_symlink(&self, target: &Path, name: &str) -> Result<(), ToolboxError> {
        let relative = target.strip_prefix(&self.root).map_err(|_| {
            ToolboxError::PathTraversal {
                entry: name.to_string(),
            }
        })?;

        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ToolboxError::PathTraversal {
                        entry: name.to_string(),
                    });
                }
                Ok(_) => {}
                // Nothing further down exists yet
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => {
                    return Err(ToolboxError::extraction(
                        &format!("failed to inspect {}", current.display()),
                        e,
                    ))
                }
            }
        }
        Ok(())
    }

    fn create_parent(&self, target: &Path) -> Result<(), ToolboxError> {
        match target.parent() {
            Some(parent) if parent != self.root => create_dir(parent).map_err(|e| {
                ToolboxError::extraction(
                    &format!("failed to create directory {}", parent.display()),
                    e,
                )
            }),
            _ => Ok(()),
        }
    }
}

fn create_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(DIR_MODE).create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_header(name: &str, kind: EntryType, size: u64) -> tar::Header {
        let mut header = tar::Header::new_old();
        let bytes = name.as_bytes();
        header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
        header.set_entry_type(kind);
        header.set_mode(0o644);
        header.set_size(size);
        header.set_cksum();
        header
    }

    fn tar_with(entries: &[(&str, EntryType, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, kind, data) in entries {
            let header = raw_header(name, *kind, data.len() as u64);
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_cancel_stops_before_next_entry() {
        let dir = tempfile::tempdir().unwrap();
        let data = tar_with(&[("toolbox/", EntryType::Directory, b"")]);
        let flag = Arc::new(AtomicBool::new(true));

        let err = ArchiveExtractor::new(dir.path())
            .with_cancel(flag)
            .extract_tar(&data[..])
            .unwrap_err();

        assert_eq!(err.code(), "cancelled");
        assert!(!dir.path().join("toolbox").exists());
    }

    #[test]
    fn test_extracts_files_dirs_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let data = {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o555);
            header.set_size(0);
            builder
                .append_data(&mut header, "toolbox/", io::empty())
                .unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_mode(0o750);
            header.set_size(5);
            builder
                .append_data(&mut header, "toolbox/bin/tool", &b"#!sh\n"[..])
                .unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, "toolbox/link", "/nix/store/abc-tool/bin/tool")
                .unwrap();
            builder.into_inner().unwrap()
        };

        let stats = ArchiveExtractor::new(dir.path())
            .extract_tar(&data[..])
            .unwrap();
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.files, 1);
        assert_eq!(stats.symlinks, 1);

        let toolbox = dir.path().join("toolbox");
        let dir_mode = fs::metadata(&toolbox).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o755);

        let tool = toolbox.join("bin/tool");
        assert_eq!(fs::read(&tool).unwrap(), b"#!sh\n");
        assert_eq!(fs::metadata(&tool).unwrap().permissions().mode() & 0o777, 0o750);

        let link = fs::read_link(toolbox.join("link")).unwrap();
        assert_eq!(link, PathBuf::from("/nix/store/abc-tool/bin/tool"));
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("work");
        fs::create_dir(&root).unwrap();

        let data = tar_with(&[("../escaped.txt", EntryType::Regular, b"pwned")]);
        let err = ArchiveExtractor::new(&root)
            .extract_tar(&data[..])
            .unwrap_err();

        assert!(matches!(err, ToolboxError::PathTraversal { .. }));
        assert!(!outer.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_absolute_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = tar_with(&[("/tmp/abs-entry", EntryType::Directory, b"")]);
        let err = ArchiveExtractor::new(dir.path())
            .extract_tar(&data[..])
            .unwrap_err();
        assert!(matches!(err, ToolboxError::PathTraversal { .. }));
    }

    #[test]
    fn test_write_through_symlink_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("work");
        let victim = outer.path().join("victim");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&victim).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "escape", &victim)
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(5);
        builder
            .append_data(&mut header, "escape/planted", &b"pwned"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let err = ArchiveExtractor::new(&root)
            .extract_tar(&data[..])
            .unwrap_err();
        assert!(matches!(err, ToolboxError::PathTraversal { .. }));
        assert!(!victim.join("planted").exists());
    }

    #[test]
    fn test_hard_link_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let data = tar_with(&[("hard", EntryType::Link, b"")]);
        let err = ArchiveExtractor::new(dir.path())
            .extract_tar(&data[..])
            .unwrap_err();
        assert!(matches!(err, ToolboxError::UnsupportedEntryType { .. }));
    }

    #[test]
    fn test_corrupt_xz_is_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArchiveExtractor::new(dir.path())
            .extract(&b"definitely not xz"[..])
            .unwrap_err();
        assert!(matches!(err, ToolboxError::ExtractionFailed(_)));
    }

    #[test]
    fn test_current_dir_entry_is_root() {
        let dir = tempfile::tempdir().unwrap();
        let data = tar_with(&[("./", EntryType::Directory, b"")]);
        let stats = ArchiveExtractor::new(dir.path())
            .extract_tar(&data[..])
            .unwrap();
        assert_eq!(stats.directories, 1);
    }
}
