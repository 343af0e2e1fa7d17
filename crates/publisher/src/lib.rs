//! Artifact publisher.
//!
//! Packages a set of local files as an OCI artifact (one layer per file,
//! titles carrying the relative paths) and pushes it. Consumers only ever
//! see the old tag or the new one: layers upload first, in a bounded
//! parallel pool, and the manifest commits last. Partially uploaded layers
//! are unreferenced garbage, not a visible state.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use protodist_core::{ArtifactRef, Digest, Error, ErrorKind, Result};
use protodist_registry::manifest::{
    annotations, Descriptor, Manifest, EMPTY_CONFIG, FILE_MEDIA_TYPE, ROLE_BINARY, ROLE_SCHEMA,
};
use protodist_registry::{RegistryClient, PUSH_TIMEOUT};

/// Default bound on concurrent layer uploads.
pub const DEFAULT_PARALLEL_UPLOADS: usize = 4;

/// Options for one publish.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Manifest-level annotations merged over the generated ones.
    pub annotations: BTreeMap<String, String>,
    /// Additional tags the manifest is bound to after the primary push.
    pub extra_tags: Vec<String>,
    /// Pull the artifact back after pushing and compare byte-for-byte.
    pub verify_roundtrip: bool,
    /// Bound on concurrent layer uploads.
    pub max_parallel_uploads: usize,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            annotations: BTreeMap::new(),
            extra_tags: Vec::new(),
            verify_roundtrip: false,
            max_parallel_uploads: DEFAULT_PARALLEL_UPLOADS,
        }
    }
}

/// One file going into an artifact.
#[derive(Debug, Clone)]
pub struct InputFile {
    /// Local path of the file.
    pub path: PathBuf,
    /// Title recorded in the layer annotation (the relative path to restore).
    pub title: String,
}

impl InputFile {
    /// Pair a local path with its logical title.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, title: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            title: title.into(),
        }
    }
}

/// Collect every regular file under a directory as input files titled by
/// their relative paths.
///
/// # Errors
///
/// Returns an error if the directory walk fails.
pub fn collect_dir(dir: &Path) -> Result<Vec<InputFile>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::internal(format!("directory walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::internal(format!("path outside walk root: {e}")))?;
        files.push(InputFile::new(
            entry.path(),
            relative.to_string_lossy().replace('\\', "/"),
        ));
    }
    Ok(files)
}

/// The publisher, pushing through a shared registry client.
pub struct Publisher {
    client: Arc<RegistryClient>,
}

impl Publisher {
    /// Create a publisher over a registry client.
    #[must_use]
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self { client }
    }

    /// Publish files as one artifact under a tagged reference.
    ///
    /// Returns the manifest digest.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ConfigInvalid`] for missing or non-regular
    /// inputs or an untagged reference, upload errors from the registry, and
    /// [`ErrorKind::IntegrityMismatch`] if round-trip verification finds a
    /// discrepancy.
    pub async fn publish(
        &self,
        files: &[InputFile],
        artifact_ref: &ArtifactRef,
        options: &PublishOptions,
    ) -> Result<Digest> {
        tokio::time::timeout(PUSH_TIMEOUT, self.publish_inner(files, artifact_ref, options))
            .await
            .map_err(|_| Error::timeout("push", PUSH_TIMEOUT.as_secs()))?
    }

    async fn publish_inner(
        &self,
        files: &[InputFile],
        artifact_ref: &ArtifactRef,
        options: &PublishOptions,
    ) -> Result<Digest> {
        if files.is_empty() {
            return Err(Error::config_invalid("no files to publish"));
        }
        if artifact_ref.tag().is_none() {
            return Err(Error::config_invalid(
                "publish target must be a tagged reference",
            ));
        }

        // Validate and load everything up front; a publish either has all
        // its layers or does not start.
        let mut layers = Vec::with_capacity(files.len());
        let mut payloads = Vec::with_capacity(files.len());
        for file in files {
            if !file.path.is_file() {
                return Err(Error::config_invalid(format!(
                    "input '{}' does not exist or is not a regular file",
                    file.path.display()
                )));
            }
            let data = std::fs::read(&file.path)?;
            let role = if file.title.ends_with(".proto") {
                ROLE_SCHEMA
            } else {
                ROLE_BINARY
            };
            let descriptor = Descriptor::for_bytes(FILE_MEDIA_TYPE, &data)
                .with_annotation(annotations::TITLE, &file.title)
                .with_annotation(annotations::ROLE, role);
            layers.push(descriptor);
            payloads.push(data);
        }

        let mut manifest_annotations = BTreeMap::new();
        manifest_annotations.insert(annotations::CREATED.to_string(), Utc::now().to_rfc3339());
        manifest_annotations.extend(options.annotations.clone());
        let manifest = Manifest::new(layers.clone(), manifest_annotations);

        let registry = artifact_ref.registry().to_string();
        let repository = artifact_ref.repository().to_string();

        // Config first, then layers in a bounded pool, then the manifest.
        self.client
            .upload_blob(
                &registry,
                &repository,
                &manifest.config.digest,
                EMPTY_CONFIG,
            )
            .await?;
        self.upload_layers(&registry, &repository, &layers, payloads, options)
            .await?;

        let digest = self.client.put_manifest(artifact_ref, &manifest).await?;

        for tag in &options.extra_tags {
            let tagged = ArtifactRef::tagged(&registry, &repository, tag)?;
            self.client.put_manifest(&tagged, &manifest).await?;
            debug!(tag, "Applied extra tag");
        }

        if options.verify_roundtrip {
            self.verify_roundtrip(files, artifact_ref, &digest).await?;
        }

        info!(
            artifact_ref = %artifact_ref,
            digest = %digest.short(),
            layers = files.len(),
            "Published artifact"
        );
        Ok(digest)
    }

    async fn upload_layers(
        &self,
        registry: &str,
        repository: &str,
        layers: &[Descriptor],
        payloads: Vec<Vec<u8>>,
        options: &PublishOptions,
    ) -> Result<()> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            options.max_parallel_uploads.max(1),
        ));
        let mut pool: JoinSet<Result<()>> = JoinSet::new();

        for (descriptor, payload) in layers.iter().cloned().zip(payloads) {
            let client = self.client.clone();
            let registry = registry.to_string();
            let repository = repository.to_string();
            let semaphore = semaphore.clone();
            pool.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::internal("upload pool closed"))?;
                client
                    .upload_blob(&registry, &repository, &descriptor.digest, &payload)
                    .await
            });
        }

        // Hard failures (auth, integrity, protocol) cancel the siblings;
        // transport failures already spent their retries inside the client,
        // so remaining uploads get to finish before the error surfaces.
        let mut soft_failure: Option<Error> = None;
        while let Some(joined) = pool.join_next().await {
            let result = joined.map_err(|e| Error::internal(format!("upload task failed: {e}")))?;
            match result {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::AuthRequired
                            | ErrorKind::AuthFailed
                            | ErrorKind::IntegrityMismatch
                            | ErrorKind::ProtocolError
                    ) =>
                {
                    pool.abort_all();
                    return Err(e);
                }
                Err(e) => soft_failure = soft_failure.or(Some(e)),
            }
        }
        match soft_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn verify_roundtrip(
        &self,
        files: &[InputFile],
        artifact_ref: &ArtifactRef,
        digest: &Digest,
    ) -> Result<()> {
        let scratch = tempfile::TempDir::new()?;
        let pinned = artifact_ref.with_digest(digest.clone());
        self.client.pull_to_dir(&pinned, scratch.path()).await?;
        compare_restored(files, scratch.path())
    }
}

/// Assert a restored directory matches the published inputs byte-for-byte.
///
/// # Errors
///
/// Returns [`ErrorKind::IntegrityMismatch`] on any missing file or content
/// difference.
pub fn compare_restored(files: &[InputFile], restored_root: &Path) -> Result<()> {
    for file in files {
        let restored = restored_root.join(&file.title);
        if !restored.is_file() {
            return Err(Error::integrity_mismatch(
                format!("restored file '{}'", file.title),
                "absent",
            ));
        }
        let original = std::fs::read(&file.path)?;
        let roundtripped = std::fs::read(&restored)?;
        if original != roundtripped {
            return Err(Error::integrity_mismatch(
                Digest::from_bytes(&original).to_string(),
                Digest::from_bytes(&roundtripped).to_string(),
            ));
        }
    }
    Ok(())
}
