//! BSR module resolver.
//!
//! Translates a BSR coordinate (`registry/owner/module[:version]`) into a
//! local directory of `.proto` files. Lookup order:
//!
//! 1. the local tree cache (`<root>/bsr/trees/<hash>/`, complete when the
//!    `.complete` marker exists)
//! 2. an OCI mirror, for curated popular modules
//! 3. `buf export` against the BSR itself
//!
//! Trees are materialised into a scratch directory and renamed into the
//! cache atomically; the marker is written after the rename, so a crashed
//! materialisation is invisible to readers and redone on the next request.
//!
//! The resolver never parses `.proto` content.

pub mod buf_cli;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use protodist_core::{ArtifactRef, CacheLayout, Error, Result};
use protodist_registry::RegistryClient;

/// Marker file indicating a fully materialised tree.
pub const COMPLETE_MARKER: &str = ".complete";

/// The registry curated modules are mirrored to by default.
pub const DEFAULT_REGISTRY: &str = "oras.birb.homes";

/// A BSR module coordinate. The version is a weak reference: it may be
/// absent and is filled in during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRef {
    /// BSR registry host (e.g. `buf.build`).
    pub registry: String,
    /// Module owner.
    pub owner: String,
    /// Module name.
    pub module: String,
    /// Requested version, if pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ModuleRef {
    /// Parse a coordinate like `buf.build/googleapis/googleapis:v1.0.0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] for malformed coordinates.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::config_invalid(format!("Invalid BSR coordinate '{s}'"));
        let (base, version) = match s.split_once(':') {
            Some((base, version)) if !version.is_empty() => (base, Some(version.to_string())),
            Some(_) => return Err(bad()),
            None => (s, None),
        };
        let mut parts = base.split('/');
        let (Some(registry), Some(owner), Some(module), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        if registry.is_empty() || owner.is_empty() || module.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            registry: registry.to_string(),
            owner: owner.to_string(),
            module: module.to_string(),
            version,
        })
    }

    /// The coordinate without version.
    #[must_use]
    pub fn base(&self) -> String {
        format!("{}/{}/{}", self.registry, self.owner, self.module)
    }

    /// The coordinate with an explicit version.
    #[must_use]
    pub fn reference(&self, version: &str) -> String {
        format!("{}:{version}", self.base())
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}:{version}", self.base()),
            None => write!(f, "{}", self.base()),
        }
    }
}

impl FromStr for ModuleRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One curated popular module with a pinned default version and mirror
/// repository.
#[derive(Debug, Clone, Copy)]
pub struct CuratedModule {
    /// The module's base coordinate.
    pub base: &'static str,
    /// Version used when the caller does not pin one.
    pub default_version: &'static str,
    /// Mirror repository under the artifact registry.
    pub mirror_repository: &'static str,
}

/// Popular modules with curated defaults and OCI mirrors.
pub const CURATED_MODULES: &[CuratedModule] = &[
    CuratedModule {
        base: "buf.build/googleapis/googleapis",
        default_version: "main",
        mirror_repository: "buck2-protobuf/bsr-cache/googleapis-googleapis",
    },
    CuratedModule {
        base: "buf.build/grpc-ecosystem/grpc-gateway",
        default_version: "v2.0.0",
        mirror_repository: "buck2-protobuf/bsr-cache/grpc-gateway",
    },
    CuratedModule {
        base: "buf.build/envoyproxy/protoc-gen-validate",
        default_version: "v0.10.1",
        mirror_repository: "buck2-protobuf/bsr-cache/protoc-gen-validate",
    },
    CuratedModule {
        base: "buf.build/connectrpc/connect",
        default_version: "v1.0.0",
        mirror_repository: "buck2-protobuf/bsr-cache/connect",
    },
];

/// Look up a curated module by base coordinate.
#[must_use]
pub fn curated(base: &str) -> Option<&'static CuratedModule> {
    CURATED_MODULES.iter().find(|m| m.base == base)
}

/// BSR module resolver with a tree cache.
pub struct BsrResolver {
    trees_dir: PathBuf,
    registry: RegistryClient,
    registry_host: String,
    buf_program: PathBuf,
}

impl BsrResolver {
    /// Create a resolver under the given cache layout.
    #[must_use]
    pub fn new(layout: &CacheLayout, registry: RegistryClient) -> Self {
        Self {
            trees_dir: layout.bsr_tree_dir(),
            registry,
            registry_host: DEFAULT_REGISTRY.to_string(),
            buf_program: PathBuf::from("buf"),
        }
    }

    /// Point the mirror lookups at a different registry host.
    #[must_use]
    pub fn with_registry_host(mut self, host: impl Into<String>) -> Self {
        self.registry_host = host.into();
        self
    }

    /// Use an explicit buf binary (e.g. one the artifact resolver supplied).
    #[must_use]
    pub fn with_buf_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.buf_program = program.into();
        self
    }

    /// The cache directory a coordinate materialises into.
    #[must_use]
    pub fn tree_path(&self, module: &ModuleRef, version: &str) -> PathBuf {
        self.trees_dir.join(tree_key(module, version))
    }

    /// Resolve a coordinate to a directory of `.proto` files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] for an unpinned non-curated module,
    /// [`Error::NotFound`] when neither mirror nor BSR knows the module, and
    /// materialisation errors otherwise.
    pub async fn resolve(&self, module: &ModuleRef) -> Result<PathBuf> {
        let version = self.resolve_version(module)?;
        let tree = self.tree_path(module, &version);

        if tree.join(COMPLETE_MARKER).is_file() {
            debug!(module = %module.base(), version, "Tree cache hit");
            return Ok(tree);
        }

        // Curated modules may be mirrored; a mirror miss is expected and
        // falls through to buf.
        if let Some(curated) = curated(&module.base()) {
            match self.materialise_from_mirror(curated, &version, &tree).await {
                Ok(()) => {
                    info!(module = %module.base(), version, "Materialised from OCI mirror");
                    return Ok(tree);
                }
                Err(e) if e.kind() == protodist_core::ErrorKind::IntegrityMismatch => {
                    return Err(e);
                }
                Err(e) => {
                    debug!(module = %module.base(), error = %e, "Mirror miss, using buf");
                }
            }
        }

        self.materialise_via_buf(module, &version, &tree).await?;
        info!(module = %module.base(), version, "Materialised via buf export");
        Ok(tree)
    }

    fn resolve_version(&self, module: &ModuleRef) -> Result<String> {
        if let Some(version) = &module.version {
            return Ok(version.clone());
        }
        if let Some(curated) = curated(&module.base()) {
            return Ok(curated.default_version.to_string());
        }
        Err(Error::config_invalid(format!(
            "unknown BSR module '{}': pin a version explicitly (curated modules: {})",
            module.base(),
            CURATED_MODULES
                .iter()
                .map(|m| m.base)
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    async fn materialise_from_mirror(
        &self,
        curated: &CuratedModule,
        version: &str,
        tree: &Path,
    ) -> Result<()> {
        let artifact_ref =
            ArtifactRef::tagged(&self.registry_host, curated.mirror_repository, version)?;
        let scratch = self.scratch_for(tree)?;
        let result = self.registry.pull_to_dir(&artifact_ref, &scratch).await;
        match result {
            Ok(restored) if restored.is_empty() => {
                let _ = std::fs::remove_dir_all(&scratch);
                Err(Error::not_found(format!("mirror {artifact_ref} is empty")))
            }
            Ok(_) => commit_tree(&scratch, tree),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&scratch);
                Err(e)
            }
        }
    }

    async fn materialise_via_buf(
        &self,
        module: &ModuleRef,
        version: &str,
        tree: &Path,
    ) -> Result<()> {
        let scratch = self.scratch_for(tree)?;
        let reference = module.reference(version);
        match buf_cli::export(&self.buf_program, &reference, &scratch).await {
            Ok(()) => {
                if !has_proto_files(&scratch) {
                    let _ = std::fs::remove_dir_all(&scratch);
                    return Err(Error::not_found(format!(
                        "export of {reference} produced no .proto files"
                    )));
                }
                commit_tree(&scratch, tree)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&scratch);
                Err(e)
            }
        }
    }

    fn scratch_for(&self, tree: &Path) -> Result<PathBuf> {
        let name = tree
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tree");
        let scratch = self
            .trees_dir
            .join(format!("{name}.partial.{}", std::process::id()));
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch)?;
        }
        std::fs::create_dir_all(&scratch)?;
        Ok(scratch)
    }
}

/// Rename a finished scratch directory into place and write the marker.
fn commit_tree(scratch: &Path, tree: &Path) -> Result<()> {
    if let Some(parent) = tree.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(scratch, tree) {
        Ok(()) => {}
        Err(_) if tree.join(COMPLETE_MARKER).is_file() => {
            // A concurrent materialisation won the rename; identical content
            // by construction.
            warn!(?tree, "Concurrent materialisation detected, keeping winner");
            std::fs::remove_dir_all(scratch)?;
            return Ok(());
        }
        Err(_) if tree.is_dir() => {
            // A stale incomplete tree from a crash; replace it.
            std::fs::remove_dir_all(tree)?;
            std::fs::rename(scratch, tree)?;
        }
        Err(e) => return Err(e.into()),
    }
    std::fs::write(tree.join(COMPLETE_MARKER), b"")?;
    Ok(())
}

fn tree_key(module: &ModuleRef, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(module.reference(version).as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

fn has_proto_files(dir: &Path) -> bool {
    fn walk(dir: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if walk(&path) {
                    return true;
                }
            } else if path.extension().and_then(|e| e.to_str()) == Some("proto") {
                return true;
            }
        }
        false
    }
    walk(dir)
}
