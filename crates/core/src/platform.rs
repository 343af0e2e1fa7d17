//! Platform detection and normalization.
//!
//! Platform strings follow the toolchain convention: `linux-x86_64`,
//! `linux-aarch64`, `darwin-arm64`, `darwin-x86_64`, `windows-x86_64`.
//! Darwin spells its ARM architecture `arm64`; Linux spells it `aarch64`.
//! OCI tags use the `amd64`/`arm64` aliases instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Linux.
    Linux,
    /// macOS.
    Darwin,
    /// Windows.
    Windows,
}

impl Os {
    /// The OS this process runs on.
    #[must_use]
    pub fn current() -> Self {
        #[cfg(target_os = "linux")]
        return Self::Linux;
        #[cfg(target_os = "macos")]
        return Self::Darwin;
        #[cfg(target_os = "windows")]
        return Self::Windows;
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        compile_error!("Unsupported OS");
    }

    /// Parse from string, accepting common aliases.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linux" => Some(Self::Linux),
            "darwin" | "macos" | "osx" => Some(Self::Darwin),
            "windows" | "win32" => Some(Self::Windows),
            _ => None,
        }
    }

    /// The executable file extension on this OS, including the dot.
    #[must_use]
    pub fn exe_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            _ => "",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Darwin => write!(f, "darwin"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM.
    Aarch64,
}

impl Arch {
    /// The architecture this process runs on.
    #[must_use]
    pub fn current() -> Self {
        #[cfg(target_arch = "x86_64")]
        return Self::X86_64;
        #[cfg(target_arch = "aarch64")]
        return Self::Aarch64;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        compile_error!("Unsupported architecture");
    }

    /// Parse from string, accepting common aliases.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Some(Self::X86_64),
            "aarch64" | "arm64" => Some(Self::Aarch64),
            _ => None,
        }
    }

    /// The OCI platform alias (`amd64` / `arm64`).
    #[must_use]
    pub fn oci_alias(self) -> &'static str {
        match self {
            Self::X86_64 => "amd64",
            Self::Aarch64 => "arm64",
        }
    }

    /// The spelling used in platform strings for the given OS.
    ///
    /// Darwin reports `arm64`; Linux and Windows report `aarch64`.
    #[must_use]
    pub fn name_for(self, os: Os) -> &'static str {
        match (self, os) {
            (Self::X86_64, _) => "x86_64",
            (Self::Aarch64, Os::Darwin) => "arm64",
            (Self::Aarch64, _) => "aarch64",
        }
    }
}

/// Platform identifier combining OS and architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
}

impl Platform {
    /// Create a new platform.
    #[must_use]
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// The platform this process runs on, computed once per process.
    #[must_use]
    pub fn current() -> Self {
        static CURRENT: OnceLock<Platform> = OnceLock::new();
        *CURRENT.get_or_init(|| Self::new(Os::current(), Arch::current()))
    }

    /// Parse from a string like `darwin-arm64` or `linux-x86_64`.
    ///
    /// Unknown OS or architecture combinations return `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (os, arch) = s.split_once('-')?;
        if arch.contains('-') {
            return None;
        }
        Some(Self {
            os: Os::parse(os)?,
            arch: Arch::parse(arch)?,
        })
    }

    /// The OCI `os/arch` selector (e.g. `linux/amd64`).
    #[must_use]
    pub fn oci_selector(&self) -> String {
        format!("{}/{}", self.os, self.arch.oci_alias())
    }

    /// The tag suffix used by artifact repositories (e.g. `linux-amd64`).
    #[must_use]
    pub fn tag_suffix(&self) -> String {
        format!("{}-{}", self.os, self.arch.oci_alias())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch.name_for(self.os))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let p = Platform::parse("darwin-arm64").unwrap();
        assert_eq!(p.os, Os::Darwin);
        assert_eq!(p.arch, Arch::Aarch64);

        let p = Platform::parse("linux-x86_64").unwrap();
        assert_eq!(p.os, Os::Linux);
        assert_eq!(p.arch, Arch::X86_64);

        let p = Platform::parse("windows-x86_64").unwrap();
        assert_eq!(p.os, Os::Windows);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(
            Platform::parse("macos-amd64").unwrap(),
            Platform::new(Os::Darwin, Arch::X86_64)
        );
        assert_eq!(
            Platform::parse("linux-arm64").unwrap(),
            Platform::new(Os::Linux, Arch::Aarch64)
        );
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(Platform::parse("plan9-x86_64").is_none());
        assert!(Platform::parse("linux-mips").is_none());
        assert!(Platform::parse("linux").is_none());
        assert!(Platform::parse("too-many-parts").is_none());
        assert!(Platform::parse("").is_none());
    }

    #[test]
    fn test_display_arch_spelling_per_os() {
        assert_eq!(
            Platform::new(Os::Darwin, Arch::Aarch64).to_string(),
            "darwin-arm64"
        );
        assert_eq!(
            Platform::new(Os::Linux, Arch::Aarch64).to_string(),
            "linux-aarch64"
        );
        assert_eq!(
            Platform::new(Os::Linux, Arch::X86_64).to_string(),
            "linux-x86_64"
        );
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for p in [
            Platform::new(Os::Linux, Arch::X86_64),
            Platform::new(Os::Linux, Arch::Aarch64),
            Platform::new(Os::Darwin, Arch::X86_64),
            Platform::new(Os::Darwin, Arch::Aarch64),
            Platform::new(Os::Windows, Arch::X86_64),
        ] {
            assert_eq!(Platform::parse(&p.to_string()), Some(p));
        }
    }

    #[test]
    fn test_oci_selector() {
        assert_eq!(
            Platform::new(Os::Linux, Arch::X86_64).oci_selector(),
            "linux/amd64"
        );
        assert_eq!(
            Platform::new(Os::Darwin, Arch::Aarch64).oci_selector(),
            "darwin/arm64"
        );
    }

    #[test]
    fn test_tag_suffix() {
        assert_eq!(
            Platform::new(Os::Linux, Arch::Aarch64).tag_suffix(),
            "linux-arm64"
        );
        assert_eq!(
            Platform::new(Os::Windows, Arch::X86_64).tag_suffix(),
            "windows-amd64"
        );
    }

    #[test]
    fn test_current_is_stable() {
        assert_eq!(Platform::current(), Platform::current());
    }

    #[test]
    fn test_exe_suffix() {
        assert_eq!(Os::Windows.exe_suffix(), ".exe");
        assert_eq!(Os::Linux.exe_suffix(), "");
    }
}
