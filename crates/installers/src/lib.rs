//! Native package-manager installers for protoc plugins.
//!
//! Two installer variants share one capability set: is the manager present
//! on this host (`available`), does it know the requested tool
//! (`supports`), perform the install (`install`), and remove it again
//! (`uninstall`). "Manager cannot provide this tool" and "install ran and
//! failed" are distinct outcomes: the former answers `supports == false`,
//! the latter is an [`install-failed`](protodist_core::ErrorKind::InstallFailed)
//! error.

pub mod catalogue;
pub mod process;

mod cargo;
mod node;

pub use cargo::CargoInstaller;
pub use node::{NodeInstaller, NodeManager};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use protodist_core::Result;

/// Specification of one installable tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Catalogue key of the plugin.
    pub name: String,
    /// Version to install.
    pub version: String,
    /// Binary name, when it differs from the plugin name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_name: Option<String>,
    /// Whether to install into the manager's global location.
    #[serde(default)]
    pub global_install: bool,
    /// Extra arguments passed through to the installer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl PluginSpec {
    /// Create a spec for a plugin at a specific version.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            binary_name: None,
            global_install: false,
            extra_args: Vec::new(),
        }
    }

    /// The binary name, defaulting to the plugin name.
    #[must_use]
    pub fn binary(&self) -> &str {
        self.binary_name.as_deref().unwrap_or(&self.name)
    }
}

/// What an install produced.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    /// Path of the installed binary.
    pub binary_path: PathBuf,
    /// Path of a wrapper script, when one was needed for a stable path.
    pub wrapper_path: Option<PathBuf>,
}

impl InstallOutcome {
    /// The path callers should execute: the wrapper when present, otherwise
    /// the binary itself.
    #[must_use]
    pub fn executable_path(&self) -> &Path {
        self.wrapper_path.as_deref().unwrap_or(&self.binary_path)
    }
}

/// The capability set every package-manager installer implements.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Manager name (e.g. "cargo", "node").
    fn name(&self) -> &'static str;

    /// Whether the host supports this manager at all.
    async fn available(&self) -> bool;

    /// Whether this manager can install the named tool.
    fn supports(&self, tool: &str) -> bool;

    /// Install the tool. Idempotent when the exact version is present.
    ///
    /// # Errors
    ///
    /// Returns [`install-failed`](protodist_core::ErrorKind::InstallFailed)
    /// when the underlying installer runs and fails.
    async fn install(&self, spec: &PluginSpec) -> Result<InstallOutcome>;

    /// Remove an installed tool. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if removal itself fails.
    async fn uninstall(&self, spec: &PluginSpec) -> Result<bool>;
}

/// Write a wrapper script giving the build system a stable executable path.
///
/// The shim does nothing but `exec` the target with any fixed arguments
/// prepended.
///
/// # Errors
///
/// Returns an error if the script cannot be written.
pub fn write_wrapper(
    dir: &Path,
    binary_name: &str,
    target: &Path,
    extra_args: &[String],
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let args = extra_args.join(" ");

    #[cfg(windows)]
    let (wrapper_path, content) = {
        let path = dir.join(format!("{binary_name}.bat"));
        let content = format!("@echo off\r\n\"{}\" {} %*\r\n", target.display(), args);
        (path, content)
    };
    #[cfg(not(windows))]
    let (wrapper_path, content) = {
        let path = dir.join(binary_name);
        let content = format!("#!/bin/sh\nexec \"{}\" {} \"$@\"\n", target.display(), args);
        (path, content)
    };

    std::fs::write(&wrapper_path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&wrapper_path, std::fs::Permissions::from_mode(0o755))?;
    }
    debug!(?wrapper_path, target = ?target, "Wrote wrapper script");
    Ok(wrapper_path)
}
