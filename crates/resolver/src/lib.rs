//! Multi-strategy artifact resolver.
//!
//! Given `(tool, version, platform)` the resolver returns a path to a
//! ready-to-execute file, using the fastest strategy that succeeds:
//!
//! ```text
//!   NEW → CHECK_MEMO ──hit──→ DONE
//!            │miss
//!            ↓
//!         TRY_PM ──ok──→ REGISTER → DONE
//!            │fail
//!            ↓
//!         TRY_OCI ──ok──→ DONE
//!            │fail
//!            ↓
//!         TRY_HTTP ──ok──→ DONE
//!            │fail
//!            ↓
//!          ERROR
//! ```
//!
//! Transitions are one-way; no strategy is retried after it fails within a
//! single request. Integrity mismatches and missing credentials abort the
//! whole request instead of falling through: a bad payload signals a
//! compromised upstream, and a missing credential should be supplied, not
//! silently routed around.

pub mod http_origin;
pub mod metrics;
pub mod table;

pub use http_origin::HttpOrigin;
pub use metrics::{MetricsSnapshot, ResolverMetrics, Strategy, StrategySnapshot};
pub use table::{PinnedArtifact, DEFAULT_REGISTRY, PINNED_ARTIFACTS};

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use protodist_cas::{DigestCache, MetadataRecord, MetadataStore};
use protodist_core::{ArtifactRef, CacheLayout, Digest, Error, ErrorKind, Platform, Result};
use protodist_credentials::CredentialStore;
use protodist_installers::{CargoInstaller, NodeInstaller, PackageManager, PluginSpec};
use protodist_registry::RegistryClient;

/// A resolvable tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tool {
    /// The protoc compiler.
    Protoc,
    /// The buf CLI.
    Buf,
    /// A protoc plugin, by catalogue name.
    Plugin(String),
}

impl Tool {
    /// The tool's name as used in tables and catalogues.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Protoc => "protoc",
            Self::Buf => "buf",
            Self::Plugin(name) => name,
        }
    }

    /// Parse a tool name; anything that is not protoc or buf is a plugin.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "protoc" => Self::Protoc,
            "buf" => Self::Buf,
            other => Self::Plugin(other.to_string()),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One resolution request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolveRequest {
    /// The tool to resolve.
    pub tool: Tool,
    /// The version to resolve.
    pub version: String,
    /// The target platform.
    pub platform: Platform,
}

impl ResolveRequest {
    /// Build a request for the current platform.
    #[must_use]
    pub fn new(tool: Tool, version: impl Into<String>) -> Self {
        Self {
            tool,
            version: version.into(),
            platform: Platform::current(),
        }
    }

    /// Build a request for an explicit platform.
    #[must_use]
    pub fn for_platform(tool: Tool, version: impl Into<String>, platform: Platform) -> Self {
        Self {
            tool,
            version: version.into(),
            platform,
        }
    }
}

type MemoKey = (String, String, Platform);

/// The artifact resolver.
///
/// One value per process, shared by reference across concurrent requests.
pub struct Resolver {
    cache: DigestCache,
    metadata: MetadataStore,
    registry: RegistryClient,
    registry_host: String,
    installers: Vec<Arc<dyn PackageManager>>,
    table: Vec<PinnedArtifact>,
    memo: Mutex<HashMap<MemoKey, PathBuf>>,
    metrics: ResolverMetrics,
    origin: HttpOrigin,
}

impl Resolver {
    /// Create a resolver with the default installers and pinned table.
    ///
    /// # Errors
    ///
    /// Returns an error if HTTP clients cannot be constructed.
    pub fn new(layout: &CacheLayout) -> Result<Self> {
        let registry = RegistryClient::new(CredentialStore::new(layout))?;
        let installers: Vec<Arc<dyn PackageManager>> = vec![
            Arc::new(CargoInstaller::new(layout.install_dir())),
            Arc::new(NodeInstaller::new(layout.install_dir())),
        ];
        Self::with_parts(layout, registry, installers)
    }

    /// Create a resolver from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin HTTP client cannot be constructed.
    pub fn with_parts(
        layout: &CacheLayout,
        registry: RegistryClient,
        installers: Vec<Arc<dyn PackageManager>>,
    ) -> Result<Self> {
        Ok(Self {
            cache: DigestCache::new(layout.blob_dir()),
            metadata: MetadataStore::new(layout.metadata_dir()),
            registry,
            registry_host: DEFAULT_REGISTRY.to_string(),
            installers,
            table: PINNED_ARTIFACTS.to_vec(),
            memo: Mutex::new(HashMap::new()),
            metrics: ResolverMetrics::default(),
            origin: HttpOrigin::new()?,
        })
    }

    /// Point the OCI strategy at a different mirror registry.
    #[must_use]
    pub fn with_registry_host(mut self, host: impl Into<String>) -> Self {
        self.registry_host = host.into();
        self
    }

    /// Replace the pinned artifact table.
    #[must_use]
    pub fn with_table(mut self, table: Vec<PinnedArtifact>) -> Self {
        self.table = table;
        self
    }

    /// The content-addressed cache behind this resolver.
    #[must_use]
    pub fn cache(&self) -> &DigestCache {
        &self.cache
    }

    /// The metadata sidecar store behind this resolver.
    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// A read-only metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Resolve a request to a ready-to-execute path.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ConfigInvalid`] for versions outside the pinned
    /// table (for table tools), fatal integrity or auth errors from any
    /// strategy, or the last strategy failure when every strategy failed.
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<PathBuf> {
        let memo_key = (
            request.tool.name().to_string(),
            request.version.clone(),
            request.platform,
        );

        let start = Instant::now();
        if let Some(path) = self.memo_get(&memo_key) {
            self.metrics.record(Strategy::Memo, true, start.elapsed());
            debug!(tool = %request.tool, version = request.version, "Memoised resolve");
            return Ok(path);
        }
        self.metrics.record(Strategy::Memo, false, start.elapsed());

        // A table tool with an unknown version can never resolve: fail fast
        // with the supported set instead of burning strategies.
        let pinned = self.pinned_for(request);
        if matches!(request.tool, Tool::Protoc | Tool::Buf) && pinned.is_none() {
            return Err(Error::config_invalid(format!(
                "unsupported {} version '{}' (available: {})",
                request.tool,
                request.version,
                table::supported_versions(request.tool.name()).join(", ")
            )));
        }

        let mut last_error: Option<Error> = None;

        if let Some(path) = self
            .try_package_manager(request, &memo_key, &mut last_error)
            .await?
        {
            return Ok(path);
        }
        if let Some(artifact) = pinned {
            if let Some(path) = self
                .try_oci(request, &artifact, &memo_key, &mut last_error)
                .await?
            {
                return Ok(path);
            }
            if let Some(path) = self
                .try_http(request, &artifact, &memo_key, &mut last_error)
                .await?
            {
                return Ok(path);
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::not_found(format!(
                "no strategy could provide {} {} for {}",
                request.tool, request.version, request.platform
            ))
        }))
    }

    async fn try_package_manager(
        &self,
        request: &ResolveRequest,
        memo_key: &MemoKey,
        last_error: &mut Option<Error>,
    ) -> Result<Option<PathBuf>> {
        for installer in &self.installers {
            if !installer.supports(request.tool.name()) {
                continue;
            }
            if !installer.available().await {
                debug!(
                    manager = installer.name(),
                    "Manager supports the tool but is unavailable on this host"
                );
                continue;
            }
            let spec = PluginSpec::new(request.tool.name(), &request.version);
            let start = Instant::now();
            match installer.install(&spec).await {
                Ok(outcome) => {
                    self.metrics
                        .record(Strategy::PackageManager, true, start.elapsed());
                    let path = outcome.executable_path().to_path_buf();
                    info!(
                        tool = %request.tool,
                        version = request.version,
                        manager = installer.name(),
                        path = %path.display(),
                        "Resolved via package manager"
                    );
                    self.memo_put(memo_key, &path);
                    return Ok(Some(path));
                }
                Err(e) => {
                    self.metrics
                        .record(Strategy::PackageManager, false, start.elapsed());
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    warn!(
                        tool = %request.tool,
                        manager = installer.name(),
                        error = %e,
                        "Package-manager strategy failed"
                    );
                    *last_error = Some(e);
                }
            }
        }
        Ok(None)
    }

    async fn try_oci(
        &self,
        request: &ResolveRequest,
        artifact: &PinnedArtifact,
        memo_key: &MemoKey,
        last_error: &mut Option<Error>,
    ) -> Result<Option<PathBuf>> {
        let artifact_ref =
            ArtifactRef::tagged(&self.registry_host, artifact.repository, &artifact.tag())?;
        let expected = Digest::parse(artifact.digest)?;
        let executable = executable_name(&request.tool, request.platform);

        let start = Instant::now();
        self.metrics.record_network_call();
        match self
            .registry
            .pull(
                &artifact_ref,
                Some(&expected),
                Some(&executable),
                &self.cache,
                &self.metadata,
            )
            .await
        {
            Ok(path) => {
                self.metrics.record(Strategy::Oci, true, start.elapsed());
                info!(
                    tool = %request.tool,
                    version = request.version,
                    artifact_ref = %artifact_ref,
                    "Resolved via OCI registry"
                );
                self.memo_put(memo_key, &path);
                Ok(Some(path))
            }
            Err(e) => {
                self.metrics.record(Strategy::Oci, false, start.elapsed());
                if is_fatal(&e) {
                    return Err(e);
                }
                debug!(artifact_ref = %artifact_ref, error = %e, "OCI strategy failed");
                *last_error = Some(e);
                Ok(None)
            }
        }
    }

    async fn try_http(
        &self,
        request: &ResolveRequest,
        artifact: &PinnedArtifact,
        memo_key: &MemoKey,
        last_error: &mut Option<Error>,
    ) -> Result<Option<PathBuf>> {
        let start = Instant::now();
        self.metrics.record_network_call();
        match self.origin.fetch(artifact, &self.cache).await {
            Ok((digest, path)) => {
                self.metrics.record(Strategy::Http, true, start.elapsed());

                // Record the resolution under the mirror ref so later runs
                // answer "is this cached?" uniformly across strategies.
                let artifact_ref = ArtifactRef::tagged(
                    &self.registry_host,
                    artifact.repository,
                    &artifact.tag(),
                )?;
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let record = MetadataRecord::new(artifact_ref, digest, size)
                    .with_title(executable_name(&request.tool, request.platform));
                self.metadata.write(&record)?;

                info!(
                    tool = %request.tool,
                    version = request.version,
                    url = artifact.origin_url,
                    "Resolved via HTTP origin"
                );
                self.memo_put(memo_key, &path);
                Ok(Some(path))
            }
            Err(e) => {
                self.metrics.record(Strategy::Http, false, start.elapsed());
                if is_fatal(&e) {
                    return Err(e);
                }
                debug!(url = artifact.origin_url, error = %e, "HTTP strategy failed");
                *last_error = Some(e);
                Ok(None)
            }
        }
    }

    /// Resolve every plugin in a named bundle, atomically as a group.
    ///
    /// Returns plugin name → path. A single member failing fails the whole
    /// bundle; no partial result is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown bundle names and the first
    /// member failure otherwise.
    pub async fn resolve_bundle(
        &self,
        bundle_name: &str,
        platform: Platform,
    ) -> Result<std::collections::BTreeMap<String, PathBuf>> {
        let bundle = protodist_installers::catalogue::bundle(bundle_name)
            .ok_or_else(|| Error::not_found(format!("bundle '{bundle_name}'")))?;

        let mut resolved = std::collections::BTreeMap::new();
        for name in bundle.plugins {
            let version = protodist_installers::catalogue::cargo_plugin(name)
                .map(|p| p.default_version)
                .or_else(|| {
                    protodist_installers::catalogue::node_plugin(name).map(|p| p.default_version)
                })
                .ok_or_else(|| Error::not_found(format!("catalogue entry for '{name}'")))?;
            let request =
                ResolveRequest::for_platform(Tool::Plugin((*name).to_string()), version, platform);
            let path = self.resolve(&request).await?;
            resolved.insert((*name).to_string(), path);
        }
        info!(bundle = bundle_name, plugins = resolved.len(), "Resolved bundle");
        Ok(resolved)
    }

    fn pinned_for(&self, request: &ResolveRequest) -> Option<PinnedArtifact> {
        let suffix = request.platform.tag_suffix();
        self.table
            .iter()
            .find(|a| {
                a.tool == request.tool.name()
                    && a.version == request.version
                    && a.platform_suffix == suffix
            })
            .copied()
    }

    fn memo_get(&self, key: &MemoKey) -> Option<PathBuf> {
        let memo = self.memo.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        memo.get(key).cloned()
    }

    fn memo_put(&self, key: &MemoKey, path: &std::path::Path) {
        let mut memo = self.memo.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        memo.insert(key.clone(), path.to_path_buf());
    }
}

/// Fatal kinds abort the ladder instead of falling through.
fn is_fatal(e: &Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::IntegrityMismatch | ErrorKind::AuthRequired | ErrorKind::AuthFailed
    )
}

fn executable_name(tool: &Tool, platform: Platform) -> String {
    format!("{}{}", tool.name(), platform.os.exe_suffix())
}
