//! Node package-manager installer for TypeScript protoc plugins.
//!
//! Selects among pnpm, yarn, and npm in that preference order (fastest
//! first), installing either globally or into a throwaway workspace under
//! the cache. Console entry points get a wrapper script so the build system
//! sees one stable executable path regardless of which manager won.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use protodist_core::{Error, Result};

use crate::catalogue::{self, NodePlugin};
use crate::process::{self, run_command};
use crate::{write_wrapper, InstallOutcome, PackageManager, PluginSpec};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// The node package managers we can drive, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeManager {
    /// pnpm, preferred.
    Pnpm,
    /// yarn.
    Yarn,
    /// npm, always-available baseline.
    Npm,
}

impl NodeManager {
    /// The executable name.
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Npm => "npm",
        }
    }

    /// Preference order, fastest first.
    pub const PREFERENCE: [Self; 3] = [Self::Pnpm, Self::Yarn, Self::Npm];

    fn add_args(self, package_at_version: &str, global: bool) -> Vec<String> {
        let mut args: Vec<String> = match (self, global) {
            (Self::Pnpm, false) | (Self::Yarn, false) => vec!["add".into()],
            (Self::Pnpm, true) => vec!["add".into(), "--global".into()],
            (Self::Yarn, true) => vec!["global".into(), "add".into()],
            (Self::Npm, false) => vec!["install".into()],
            (Self::Npm, true) => vec!["install".into(), "--global".into()],
        };
        args.push(package_at_version.to_string());
        args
    }

    fn remove_args(self, package: &str, global: bool) -> Vec<String> {
        let mut args: Vec<String> = match (self, global) {
            (Self::Pnpm, false) | (Self::Yarn, false) => vec!["remove".into()],
            (Self::Pnpm, true) => vec!["remove".into(), "--global".into()],
            (Self::Yarn, true) => vec!["global".into(), "remove".into()],
            (Self::Npm, false) => vec!["uninstall".into()],
            (Self::Npm, true) => vec!["uninstall".into(), "--global".into()],
        };
        args.push(package.to_string());
        args
    }
}

/// Installer driving whichever node package manager the host has.
pub struct NodeInstaller {
    install_root: PathBuf,
    prefer: Option<NodeManager>,
    selected: OnceCell<Option<NodeManager>>,
}

impl NodeInstaller {
    /// Create an installer placing its workspaces under the given directory.
    #[must_use]
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            prefer: None,
            selected: OnceCell::new(),
        }
    }

    /// Force a specific manager instead of the preference order.
    #[must_use]
    pub fn with_preferred(mut self, manager: NodeManager) -> Self {
        self.prefer = Some(manager);
        self
    }

    /// The manager this host will use, detected once.
    pub async fn manager(&self) -> Option<NodeManager> {
        *self
            .selected
            .get_or_init(|| async {
                if let Some(preferred) = self.prefer {
                    if process::probe(preferred.program()).await {
                        return Some(preferred);
                    }
                }
                for candidate in NodeManager::PREFERENCE {
                    if process::probe(candidate.program()).await {
                        debug!(manager = candidate.program(), "Selected node package manager");
                        return Some(candidate);
                    }
                }
                None
            })
            .await
    }

    fn workspace(&self, spec: &PluginSpec) -> PathBuf {
        self.install_root
            .join("node")
            .join(format!("{}-{}", spec.name, spec.version))
    }

    fn entry_point(&self, spec: &PluginSpec, plugin: &NodePlugin) -> PathBuf {
        self.workspace(spec)
            .join("node_modules")
            .join(".bin")
            .join(plugin.binary)
    }

    async fn global_bin_dir(&self, manager: NodeManager) -> Result<PathBuf> {
        let output = match manager {
            NodeManager::Npm => {
                let out =
                    run_command("npm", &["prefix", "--global"], None, Duration::from_secs(30))
                        .await?;
                if !out.success {
                    return Err(Error::install_failed("npm", out.stderr));
                }
                return Ok(PathBuf::from(out.stdout).join("bin"));
            }
            NodeManager::Yarn => {
                run_command("yarn", &["global", "bin"], None, Duration::from_secs(30)).await?
            }
            NodeManager::Pnpm => {
                run_command("pnpm", &["bin", "--global"], None, Duration::from_secs(30)).await?
            }
        };
        if !output.success {
            return Err(Error::install_failed(manager.program(), output.stderr));
        }
        Ok(PathBuf::from(output.stdout))
    }

    async fn install_local(
        &self,
        manager: NodeManager,
        spec: &PluginSpec,
        plugin: &NodePlugin,
    ) -> Result<InstallOutcome> {
        let workspace = self.workspace(spec);
        std::fs::create_dir_all(&workspace)?;
        let package_json = workspace.join("package.json");
        if !package_json.is_file() {
            std::fs::write(
                &package_json,
                b"{\n  \"name\": \"protodist-plugin-workspace\",\n  \"private\": true\n}\n",
            )?;
        }

        let spec_arg = format!("{}@{}", plugin.package, spec.version);
        let args = manager.add_args(&spec_arg, false);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output =
            run_command(manager.program(), &arg_refs, Some(&workspace), INSTALL_TIMEOUT).await?;
        if !output.success {
            return Err(Error::install_failed(spec.name.clone(), output.stderr));
        }

        let entry = self.entry_point(spec, plugin);
        if !entry.exists() {
            return Err(Error::install_failed(
                spec.name.clone(),
                format!("install succeeded but {} is missing", entry.display()),
            ));
        }

        // The entry point lives inside node_modules; give the caller a shim
        // with a deterministic location instead.
        let wrapper = write_wrapper(&workspace.join("bin"), plugin.binary, &entry, &[])?;
        if !process::validate_binary(&wrapper).await {
            return Err(Error::install_failed(
                spec.name.clone(),
                "installed entry point does not respond to --version or --help",
            ));
        }
        Ok(InstallOutcome {
            binary_path: entry,
            wrapper_path: Some(wrapper),
        })
    }

    async fn install_global(
        &self,
        manager: NodeManager,
        spec: &PluginSpec,
        plugin: &NodePlugin,
    ) -> Result<InstallOutcome> {
        let spec_arg = format!("{}@{}", plugin.package, spec.version);
        let args = manager.add_args(&spec_arg, true);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_command(manager.program(), &arg_refs, None, INSTALL_TIMEOUT).await?;
        if !output.success {
            return Err(Error::install_failed(spec.name.clone(), output.stderr));
        }

        let binary_path = self.global_bin_dir(manager).await?.join(plugin.binary);
        if !binary_path.exists() {
            return Err(Error::install_failed(
                spec.name.clone(),
                format!("global install left no binary at {}", binary_path.display()),
            ));
        }
        Ok(InstallOutcome {
            binary_path,
            wrapper_path: None,
        })
    }
}

#[async_trait]
impl PackageManager for NodeInstaller {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn available(&self) -> bool {
        self.manager().await.is_some()
    }

    fn supports(&self, tool: &str) -> bool {
        catalogue::node_plugin(tool).is_some()
    }

    async fn install(&self, spec: &PluginSpec) -> Result<InstallOutcome> {
        let plugin = catalogue::node_plugin(&spec.name).ok_or_else(|| {
            Error::not_found(format!("node catalogue has no plugin '{}'", spec.name))
        })?;

        // Idempotent: an existing workspace wrapper is the install.
        let wrapper = self.workspace(spec).join("bin").join(plugin.binary);
        if wrapper.is_file() {
            debug!(plugin = spec.name, version = spec.version, "Already installed");
            return Ok(InstallOutcome {
                binary_path: self.entry_point(spec, plugin),
                wrapper_path: Some(wrapper),
            });
        }

        let Some(manager) = self.manager().await else {
            return Err(Error::not_found(
                "no node package manager (pnpm, yarn, npm) on this host",
            ));
        };

        info!(
            plugin = spec.name,
            version = spec.version,
            manager = manager.program(),
            "Installing via node package manager"
        );
        if spec.global_install {
            self.install_global(manager, spec, plugin).await
        } else {
            self.install_local(manager, spec, plugin).await
        }
    }

    async fn uninstall(&self, spec: &PluginSpec) -> Result<bool> {
        if spec.global_install {
            let Some(plugin) = catalogue::node_plugin(&spec.name) else {
                return Ok(false);
            };
            let Some(manager) = self.manager().await else {
                return Ok(false);
            };
            let args = manager.remove_args(plugin.package, true);
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let output =
                run_command(manager.program(), &arg_refs, None, INSTALL_TIMEOUT).await?;
            return Ok(output.success);
        }

        let workspace = self.workspace(spec);
        if !workspace.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&workspace)?;
        info!(plugin = spec.name, version = spec.version, "Uninstalled");
        Ok(true)
    }
}
