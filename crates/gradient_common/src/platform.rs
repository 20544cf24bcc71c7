//! Host platform naming for toolbox archives.
//!
//! Archives are published as `<playbook>.<os>.<arch>.tar.xz` using Go-style
//! os/arch names (linux/darwin, amd64/arm64).

/// Go-style operating system name for the running host
pub fn host_os() -> &'static str {
    os_name(std::env::consts::OS)
}

/// Go-style architecture name for the running host
pub fn host_arch() -> &'static str {
    arch_name(std::env::consts::ARCH)
}

fn os_name(os: &'static str) -> &'static str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn arch_name(arch: &'static str) -> &'static str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        other => other,
    }
}

/// Playbook run when none is named on the command line
pub fn default_playbook() -> &'static str {
    if host_os() == "linux" {
        "60-second-linux"
    } else {
        "60-second-darwin"
    }
}

/// Archive file name for a playbook on the given platform
pub fn archive_name(playbook: &str, os: &str, arch: &str) -> String {
    format!("{}.{}.{}.tar.xz", playbook, os, arch)
}

/// Full locator of a playbook's archive for this host
pub fn toolbox_locator(repo: &str, playbook: &str) -> String {
    format!("{}{}", repo, archive_name(playbook, host_os(), host_arch()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_go_style_names() {
        assert_eq!(os_name("macos"), "darwin");
        assert_eq!(os_name("linux"), "linux");
        assert_eq!(arch_name("x86_64"), "amd64");
        assert_eq!(arch_name("aarch64"), "arm64");
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(
            archive_name("60-second-linux", "linux", "amd64"),
            "60-second-linux.linux.amd64.tar.xz"
        );
    }

    #[test]
    fn test_locator_appends_to_repo() {
        let locator = toolbox_locator("file:///srv/tb/", "net");
        assert!(locator.starts_with("file:///srv/tb/net."));
        assert!(locator.ends_with(".tar.xz"));
    }
}
