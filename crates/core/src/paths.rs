//! Cache directory layout.
//!
//! Everything protodist writes lives under one per-user cache root:
//!
//! ```text
//! <root>/oras/<dd>/<digest>      blob storage
//! <root>/metadata/<safe-ref>.json  metadata sidecar per resolved ref
//! <root>/bsr/trees/<hash>/       materialised .proto trees
//! <root>/credentials/store.enc   encrypted credential blob
//! <root>/shims/                  wrapper scripts with stable paths
//! <root>/installs/               package-manager install workspaces
//! ```

use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "PROTODIST_CACHE_DIR";

/// Environment variable naming a service-account credential file.
pub const SERVICE_ACCOUNT_ENV: &str = "PROTODIST_SERVICE_ACCOUNT_FILE";

/// The on-disk layout rooted at a per-user cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Create a layout rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the layout from the environment.
    ///
    /// `PROTODIST_CACHE_DIR` wins; otherwise the platform cache directory
    /// (`~/.cache/protodist` on Linux) is used, falling back to a relative
    /// `.cache/protodist` when no home directory is known.
    #[must_use]
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.is_empty() {
                return Self::new(dir);
            }
        }
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("protodist");
        Self::new(root)
    }

    /// The cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blob storage directory.
    #[must_use]
    pub fn blob_dir(&self) -> PathBuf {
        self.root.join("oras")
    }

    /// Metadata sidecar directory.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    /// Materialised BSR tree cache directory.
    #[must_use]
    pub fn bsr_tree_dir(&self) -> PathBuf {
        self.root.join("bsr").join("trees")
    }

    /// Credential storage directory.
    #[must_use]
    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join("credentials")
    }

    /// Directory for wrapper scripts with deterministic paths.
    #[must_use]
    pub fn shim_dir(&self) -> PathBuf {
        self.root.join("shims")
    }

    /// Scratch directory for package-manager installs.
    #[must_use]
    pub fn install_dir(&self) -> PathBuf {
        self.root.join("installs")
    }
}
