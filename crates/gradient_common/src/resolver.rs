//! Command resolution against the toolbox package store.
//!
//! Each diagnostic's binary is looked up as `<store>/<entry>/{bin,sbin}/<name>`.
//! Store entries are visited in lexical order and the first executable match
//! wins. One unresolvable diagnostic fails the whole batch.
//!
//! Arguments are not quoted: templates are split on whitespace and re-joined
//! with single spaces.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bundle::Bundle;
use crate::error::ToolboxError;
use crate::playbook::DiagnosticSpec;
use crate::sandbox::Sandbox;

/// Subdirectories of a store entry searched for binaries, in order
const BIN_DIRS: [&str; 2] = ["bin", "sbin"];

/// Upper bound for a playbook timeout override
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// A diagnostic bound to its concrete sandboxed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    /// Position in the playbook's command list
    pub index: usize,
    pub spec: DiagnosticSpec,
    /// None when the binary could not be located
    pub invocation: Option<String>,
    pub timeout: Duration,
}

impl ResolvedCommand {
    pub fn description(&self) -> &str {
        &self.spec.description
    }
}

/// Maps playbook diagnostics onto store binaries
#[derive(Debug, Clone)]
pub struct CommandResolver {
    default_timeout: Duration,
}

impl CommandResolver {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Resolve every diagnostic of the bundle's playbook, in order
    pub fn resolve(&self, bundle: &Bundle) -> Result<Vec<ResolvedCommand>, ToolboxError> {
        let sandbox = Sandbox::for_bundle(bundle);
        self.resolve_specs(&bundle.playbook().commands, &bundle.store_dir(), &sandbox)
    }

    pub fn resolve_specs(
        &self,
        specs: &[DiagnosticSpec],
        store: &Path,
        sandbox: &Sandbox,
    ) -> Result<Vec<ResolvedCommand>, ToolboxError> {
        let entries = store_entries(store);
        debug!(store = %store.display(), entries = entries.len(), "Scanning package store");

        let mut resolved = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let parts: Vec<&str> = spec.command.split_whitespace().collect();
            let (binary, args) = match parts.split_first() {
                Some((binary, args)) => (*binary, args),
                None => {
                    return Err(ToolboxError::EmptyCommand {
                        command: spec.command.clone(),
                    })
                }
            };

            let path = match find_in_entries(&entries, binary) {
                Some(path) => path,
                None => {
                    warn!(index, binary, "Binary not found in toolbox store");
                    return Err(ToolboxError::BinaryNotFound {
                        binary: binary.to_string(),
                    });
                }
            };

            resolved.push(ResolvedCommand {
                index,
                spec: spec.clone(),
                invocation: Some(sandbox.wrap(&path, args)),
                timeout: self.effective_timeout(spec),
            });
        }

        info!("Resolved {} diagnostics", resolved.len());
        Ok(resolved)
    }

    /// Playbook override when positive (capped at a day), otherwise the default
    pub fn effective_timeout(&self, spec: &DiagnosticSpec) -> Duration {
        match spec.timeout_seconds {
            Some(secs) if secs > 0 => {
                Duration::from_secs((secs as u64).min(MAX_TIMEOUT_SECS))
            }
            _ => self.default_timeout,
        }
    }
}

/// Locate an executable named `name` in the store
pub fn find_binary(store: &Path, name: &str) -> Option<PathBuf> {
    find_in_entries(&store_entries(store), name)
}

/// Immediate subdirectories of the store, sorted by name; unreadable store = empty
fn store_entries(store: &Path) -> Vec<PathBuf> {
    let reader = match fs::read_dir(store) {
        Ok(reader) => reader,
        Err(e) => {
            debug!(store = %store.display(), error = %e, "Package store unreadable");
            return Vec::new();
        }
    };

    let mut entries: Vec<(std::ffi::OsString, PathBuf)> = reader
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| (entry.file_name(), entry.path()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().map(|(_, path)| path).collect()
}

fn find_in_entries(entries: &[PathBuf], name: &str) -> Option<PathBuf> {
    entries.iter().find_map(|entry| {
        BIN_DIRS
            .iter()
            .map(|dir| entry.join(dir).join(name))
            .find(|candidate| is_executable(candidate))
    })
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Find a resolved diagnostic by its description
pub fn find_by_description<'a>(
    commands: &'a [ResolvedCommand],
    description: &str,
) -> Option<&'a ResolvedCommand> {
    commands.iter().find(|c| c.description() == description)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(store: &Path, entry: &str, dir: &str, name: &str, mode: u32) -> PathBuf {
        let bin = store.join(entry).join(dir);
        fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn spec(command: &str) -> DiagnosticSpec {
        DiagnosticSpec {
            command: command.to_string(),
            description: command.to_string(),
            timeout_seconds: None,
        }
    }

    #[test]
    fn test_resolves_bin_and_sbin() {
        let store = tempfile::tempdir().unwrap();
        let uptime = install(store.path(), "aaa-procps", "bin", "uptime", 0o755);
        let ss = install(store.path(), "bbb-iproute2", "sbin", "ss", 0o755);
        let sandbox = Sandbox::new("/w/proot", "/w/nix");

        let resolved = CommandResolver::new(Duration::from_secs(5))
            .resolve_specs(&[spec("uptime"), spec("ss -tan")], store.path(), &sandbox)
            .unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].index, 0);
        assert_eq!(
            resolved[0].invocation.as_deref(),
            Some(format!("/w/proot -b /w/nix:/nix {}", uptime.display()).as_str())
        );
        assert_eq!(
            resolved[1].invocation.as_deref(),
            Some(format!("/w/proot -b /w/nix:/nix {} -tan", ss.display()).as_str())
        );
    }

    #[test]
    fn test_non_executable_is_skipped() {
        let store = tempfile::tempdir().unwrap();
        install(store.path(), "aaa-docs", "bin", "free", 0o644);
        let real = install(store.path(), "bbb-procps", "bin", "free", 0o755);
        assert_eq!(find_binary(store.path(), "free"), Some(real));
    }

    #[test]
    fn test_first_entry_in_lexical_order_wins() {
        let store = tempfile::tempdir().unwrap();
        install(store.path(), "zzz-busybox", "bin", "top", 0o755);
        let first = install(store.path(), "aaa-procps", "bin", "top", 0o755);
        assert_eq!(find_binary(store.path(), "top"), Some(first));
    }

    #[test]
    fn test_missing_binary_fails_whole_batch() {
        let store = tempfile::tempdir().unwrap();
        install(store.path(), "aaa-procps", "bin", "uptime", 0o755);
        let sandbox = Sandbox::new("/w/proot", "/w/nix");

        let err = CommandResolver::new(Duration::from_secs(5))
            .resolve_specs(&[spec("uptime"), spec("iostat -xz 1")], store.path(), &sandbox)
            .unwrap_err();
        assert!(matches!(err, ToolboxError::BinaryNotFound { ref binary } if binary == "iostat"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let store = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new("/w/proot", "/w/nix");
        let err = CommandResolver::new(Duration::from_secs(5))
            .resolve_specs(&[spec("   ")], store.path(), &sandbox)
            .unwrap_err();
        assert!(matches!(err, ToolboxError::EmptyCommand { .. }));
    }

    #[test]
    fn test_missing_store_means_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_binary(&dir.path().join("nix/store"), "uptime"), None);
    }

    #[test]
    fn test_effective_timeout() {
        let resolver = CommandResolver::new(Duration::from_secs(5));
        let mut s = spec("vmstat 1 5");
        assert_eq!(resolver.effective_timeout(&s), Duration::from_secs(5));
        s.timeout_seconds = Some(12);
        assert_eq!(resolver.effective_timeout(&s), Duration::from_secs(12));
        s.timeout_seconds = Some(0);
        assert_eq!(resolver.effective_timeout(&s), Duration::from_secs(5));
        s.timeout_seconds = Some(-3);
        assert_eq!(resolver.effective_timeout(&s), Duration::from_secs(5));
        s.timeout_seconds = Some(i64::MAX);
        assert_eq!(
            resolver.effective_timeout(&s),
            Duration::from_secs(MAX_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_resolution_is_repeatable() {
        let store = tempfile::tempdir().unwrap();
        install(store.path(), "aaa-procps", "bin", "uptime", 0o755);
        let sandbox = Sandbox::new("/w/proot", "/w/nix");
        let resolver = CommandResolver::new(Duration::from_secs(5));
        let specs = [spec("uptime -p")];

        let first = resolver.resolve_specs(&specs, store.path(), &sandbox).unwrap();
        let second = resolver.resolve_specs(&specs, store.path(), &sandbox).unwrap();
        assert_eq!(first, second);
    }
}
