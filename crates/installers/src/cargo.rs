//! Cargo installer for Rust protoc plugins.
//!
//! Installs catalogue crates with `cargo install --root` into a per-plugin
//! directory under the cache, so an exact version is trivially detected as
//! already present and removal is a directory delete.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use protodist_core::{Error, Result};

use crate::catalogue::{self, CargoPlugin};
use crate::process::{self, run_command};
use crate::{InstallOutcome, PackageManager, PluginSpec};

/// Deadline for one `cargo install` run. Compiles are slow.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Installer backed by `cargo install`.
pub struct CargoInstaller {
    install_root: PathBuf,
}

impl CargoInstaller {
    /// Create an installer placing its roots under the given directory.
    #[must_use]
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
        }
    }

    fn plugin_root(&self, spec: &PluginSpec) -> PathBuf {
        self.install_root
            .join("cargo")
            .join(format!("{}-{}", spec.name, spec.version))
    }

    fn binary_path(&self, spec: &PluginSpec, plugin: &CargoPlugin) -> PathBuf {
        self.plugin_root(spec).join("bin").join(plugin.binary)
    }
}

#[async_trait]
impl PackageManager for CargoInstaller {
    fn name(&self) -> &'static str {
        "cargo"
    }

    async fn available(&self) -> bool {
        process::probe("cargo").await
    }

    fn supports(&self, tool: &str) -> bool {
        catalogue::cargo_plugin(tool).is_some()
    }

    async fn install(&self, spec: &PluginSpec) -> Result<InstallOutcome> {
        let plugin = catalogue::cargo_plugin(&spec.name).ok_or_else(|| {
            Error::not_found(format!("cargo catalogue has no plugin '{}'", spec.name))
        })?;

        let binary_path = self.binary_path(spec, plugin);
        if binary_path.is_file() {
            debug!(plugin = spec.name, version = spec.version, "Already installed");
            return Ok(InstallOutcome {
                binary_path,
                wrapper_path: None,
            });
        }

        let root = self.plugin_root(spec);
        std::fs::create_dir_all(&root)?;
        let root_str = root.to_string_lossy().to_string();
        let mut args = vec![
            "install",
            plugin.crate_name,
            "--version",
            spec.version.as_str(),
            "--root",
            root_str.as_str(),
            "--locked",
        ];
        args.extend(spec.extra_args.iter().map(String::as_str));

        info!(plugin = spec.name, version = spec.version, "Installing via cargo");
        let output = run_command("cargo", &args, None, INSTALL_TIMEOUT).await?;
        if !output.success {
            return Err(Error::install_failed(spec.name.clone(), output.stderr));
        }

        if !binary_path.is_file() {
            return Err(Error::install_failed(
                spec.name.clone(),
                format!("cargo reported success but {} is missing", binary_path.display()),
            ));
        }
        if !process::validate_binary(&binary_path).await {
            return Err(Error::install_failed(
                spec.name.clone(),
                "installed binary does not respond to --version or --help",
            ));
        }

        Ok(InstallOutcome {
            binary_path,
            wrapper_path: None,
        })
    }

    async fn uninstall(&self, spec: &PluginSpec) -> Result<bool> {
        let root = self.plugin_root(spec);
        if !root.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&root)?;
        info!(plugin = spec.name, version = spec.version, "Uninstalled");
        Ok(true)
    }
}
