//! Metadata sidecars for resolved references.
//!
//! Each resolved reference gets a JSON sidecar so "is this ref known?" and
//! "what is cached?" are answered without touching blobs:
//!
//! ```text
//! <root>/metadata/<safe-ref>.json
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use protodist_core::{ArtifactRef, Digest, Result};

/// Sidecar record for one resolved reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// The reference that was resolved.
    pub artifact_ref: ArtifactRef,
    /// The digest the reference resolved to.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: u64,
    /// When the blob entered the cache.
    pub cached_at: DateTime<Utc>,
    /// The logical file name recorded in the manifest's title annotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
}

impl MetadataRecord {
    /// Build a record stamped with the current time.
    #[must_use]
    pub fn new(artifact_ref: ArtifactRef, digest: Digest, size: u64) -> Self {
        Self {
            artifact_ref,
            digest,
            size,
            cached_at: Utc::now(),
            original_title: None,
        }
    }

    /// Attach the original title annotation.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.original_title = Some(title.into());
        self
    }
}

/// Store of metadata sidecars, one JSON file per resolved reference.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    /// Create a store rooted at the given metadata directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The sidecar path for a reference.
    #[must_use]
    pub fn path_for(&self, artifact_ref: &ArtifactRef) -> PathBuf {
        self.dir.join(format!("{}.json", artifact_ref.safe_filename()))
    }

    /// Write (or replace) the sidecar for a reference.
    ///
    /// The write goes through a temporary file and rename so concurrent
    /// readers never see a torn record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write(&self, record: &MetadataRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.artifact_ref);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!(artifact_ref = %record.artifact_ref, "Wrote metadata record");
        Ok(())
    }

    /// Read the sidecar for a reference, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read(&self, artifact_ref: &ArtifactRef) -> Result<Option<MetadataRecord>> {
        let path = self.path_for(artifact_ref);
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Whether a reference has a sidecar (without reading the blob).
    #[must_use]
    pub fn contains(&self, artifact_ref: &ArtifactRef) -> bool {
        self.path_for(artifact_ref).is_file()
    }

    /// Remove the sidecar for a reference. Missing sidecars are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if unlinking fails.
    pub fn remove(&self, artifact_ref: &ArtifactRef) -> Result<()> {
        let path = self.path_for(artifact_ref);
        if path.is_file() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove every sidecar that points at the given digest.
    ///
    /// Called when a blob is evicted, so records live and die with their
    /// cache entries. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or unlinking fails.
    pub fn remove_for_digest(&self, digest: &Digest) -> Result<usize> {
        let mut removed = 0;
        for (path, record) in self.list_with_paths()? {
            if record.digest == *digest {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// List all known records.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<MetadataRecord>> {
        Ok(self.list_with_paths()?.into_iter().map(|(_, r)| r).collect())
    }

    fn list_with_paths(&self) -> Result<Vec<(PathBuf, MetadataRecord)>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path)?;
            match serde_json::from_slice(&data) {
                Ok(record) => records.push((path, record)),
                Err(e) => {
                    // A torn or foreign file is not fatal for listing.
                    warn!(?path, error = %e, "Skipping unreadable metadata record");
                }
            }
        }
        Ok(records)
    }

    /// Remove every sidecar whose blob is gone from the cache.
    ///
    /// Records live and die with their cache entries; this is the GC pass
    /// that enforces it after eviction. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or unlinking fails.
    pub fn prune_orphans(&self, cache: &crate::DigestCache) -> Result<usize> {
        let mut removed = 0;
        for (path, record) in self.list_with_paths()? {
            if cache.lookup(&record.digest).is_none() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove sidecars older than the given number of days.
    ///
    /// `None` removes everything. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or unlinking fails.
    pub fn clear_older_than(&self, days: Option<u64>) -> Result<usize> {
        let cutoff = days.map(|d| Utc::now() - chrono::Duration::days(i64::try_from(d).unwrap_or(i64::MAX)));
        let mut removed = 0;
        for (path, record) in self.list_with_paths()? {
            if cutoff.is_none_or(|c| record.cached_at < c) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// The metadata directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
