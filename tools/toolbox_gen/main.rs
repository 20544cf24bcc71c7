//! Toolbox Generator - builds toolbox archives from playbooks.
//!
//! Usage:
//!   toolbox_gen --playbook playbooks/60-second-linux.yaml --out dist/
//!
//! On Linux the playbook's nixpkgs packages are copied into a private store
//! and a static proot is bundled. The result is written as
//! `<out>/<id>.<os>.<arch>.tar.xz` with a `.sha256` sidecar.

use anyhow::{bail, Context, Result};
use clap::Parser;
use gradient_common::bundle::{PLAYBOOK_FILE, SANDBOX_BIN, TOOLBOX_DIR};
use gradient_common::pack::pack_dir;
use gradient_common::platform::{archive_name, host_arch, host_os};
use gradient_common::Playbook;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PROOT_AMD64_URL: &str = "https://web.archive.org/web/20240412082958if_/http://dl-cdn.alpinelinux.org/alpine/edge/testing/x86_64/proot-static-5.4.0-r0.apk";
const PROOT_ARM64_URL: &str = "https://web.archive.org/web/20240412083320if_/http://dl-cdn.alpinelinux.org/alpine/edge/testing/aarch64/proot-static-5.4.0-r0.apk";
const PROOT_ENTRY: &str = "proot.static";
const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "toolbox_gen")]
#[command(about = "Generate toolbox archives from playbook configurations", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to playbook file
    #[arg(short, long)]
    playbook: PathBuf,

    /// Output directory for the generated archive
    #[arg(short, long, default_value = ".")]
    out: PathBuf,
}

/// Work directory that regains owner write permission before removal
struct WorkDir {
    dir: Option<TempDir>,
}

impl WorkDir {
    fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("toolbox_work_")
            .tempdir()
            .context("Failed to create temporary workdir")?;
        Ok(Self { dir: Some(dir) })
    }

    fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            make_writable(dir.path());
            if let Err(e) = dir.close() {
                warn!("Failed to remove workdir: {}", e);
            }
        }
    }
}

/// `chmod -R u+w`; nix store copies are read-only
fn make_writable(root: &Path) {
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.path_is_symlink() {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o200);
            let _ = fs::set_permissions(entry.path(), perms);
        }
    }
}

fn validate(playbook: &Playbook, os: &str) -> Result<()> {
    if playbook.id.trim().is_empty() {
        bail!("playbook has no id");
    }
    if os == "linux" && playbook.nixpkgs.packages.is_empty() {
        bail!("no nixpkgs.packages listed in playbook");
    }
    Ok(())
}

fn flake_ref(version: &str) -> String {
    if version.is_empty() {
        "nixpkgs".to_string()
    } else {
        format!("github:NixOS/nixpkgs/{}", version)
    }
}

fn nix_copy_args(dest: &Path, version: &str, packages: &[String]) -> Vec<String> {
    let flake = flake_ref(version);
    let mut args: Vec<String> = [
        "--extra-experimental-features",
        "flakes",
        "--extra-experimental-features",
        "nix-command",
        "copy",
        "--to",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(dest.display().to_string());
    args.extend(packages.iter().map(|p| format!("{}#{}", flake, p)));
    args
}

fn nix_copy(dest: &Path, version: &str, packages: &[String]) -> Result<()> {
    info!("Copying {} packages into {}", packages.len(), dest.display());
    let status = Command::new("nix")
        .args(nix_copy_args(dest, version, packages))
        .status()
        .context("nix not found in PATH")?;
    if !status.success() {
        bail!("nix copy failed: {}", status);
    }
    Ok(())
}

fn proot_url(arch: &str) -> Result<&'static str> {
    match arch {
        "amd64" => Ok(PROOT_AMD64_URL),
        "arm64" => Ok(PROOT_ARM64_URL),
        other => bail!(
            "unsupported architecture {}; only amd64 and arm64 are supported",
            other
        ),
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.yellow} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn fetch_proot(dest: &Path, arch: &str) -> Result<()> {
    let url = proot_url(arch)?;
    let pb = spinner("Downloading static proot");

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()
        .context("Failed to build HTTP client")?;
    let response = client.get(url).send().context("proot download failed")?;
    if !response.status().is_success() {
        pb.abandon_with_message("proot download failed");
        bail!("download failed: {}", response.status());
    }

    install_proot_from_apk(response, dest)?;
    pb.finish_with_message("Installed static proot");
    Ok(())
}

/// An APK is concatenated gzip'd tar segments; pull out the static binary
fn install_proot_from_apk<R: Read>(apk: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(flate2::read::MultiGzDecoder::new(apk));
    archive.set_ignore_zeros(true);

    for entry in archive.entries().context("Failed to read APK")? {
        let mut entry = entry.context("Failed to read APK entry")?;
        let path = entry.path().context("Invalid APK entry path")?.into_owned();
        if path.file_name().and_then(|n| n.to_str()) != Some(PROOT_ENTRY) {
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o755)
            .open(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        io::copy(&mut entry, &mut out)?;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
        return Ok(());
    }
    bail!("{} not found in APK", PROOT_ENTRY)
}

fn copy_playbook(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest).with_context(|| format!("Failed to copy {}", src.display()))?;
    fs::set_permissions(dest, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Write the archive and its checksum sidecar; returns the hex digest
fn write_archive(toolbox: &Path, out_path: &Path) -> Result<String> {
    let pb = spinner("Compressing toolbox");
    let file = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let writer = pack_dir(toolbox, TOOLBOX_DIR, BufWriter::new(file))
        .context("Failed to create tar.xz")?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("Failed to flush archive")?
        .sync_all()?;
    pb.finish_with_message("Compressed toolbox");

    let mut hasher = Sha256::new();
    io::copy(&mut File::open(out_path)?, &mut hasher)?;
    let digest = hex::encode(hasher.finalize());

    let name = out_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar = PathBuf::from(format!("{}.sha256", out_path.display()));
    fs::write(&sidecar, format!("{}  {}\n", digest, name))?;
    Ok(digest)
}

fn generate(cli: &Cli) -> Result<PathBuf> {
    let playbook = Playbook::from_path(&cli.playbook)
        .with_context(|| format!("Failed to read playbook {}", cli.playbook.display()))?;
    let (os, arch) = (host_os(), host_arch());
    validate(&playbook, os)?;

    let work = WorkDir::new()?;
    let toolbox = work.path().join(TOOLBOX_DIR);
    fs::create_dir_all(&toolbox)?;

    if os == "linux" {
        nix_copy(&toolbox, &playbook.nixpkgs.version, &playbook.nixpkgs.packages)?;
        fetch_proot(&toolbox.join(SANDBOX_BIN), arch)?;
    }
    copy_playbook(&cli.playbook, &toolbox.join(PLAYBOOK_FILE))?;

    fs::create_dir_all(&cli.out)
        .with_context(|| format!("Failed to create output directory {}", cli.out.display()))?;
    let out_dir = fs::canonicalize(&cli.out)?;
    let out_path = out_dir.join(archive_name(&playbook.id, os, arch));

    let digest = write_archive(&toolbox, &out_path)?;
    info!(sha256 = %digest, "Archive written");
    Ok(out_path)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("GRADIENT_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let out_path = generate(&cli)?;
    println!("created {}", out_path.display());
    Ok(())
}
