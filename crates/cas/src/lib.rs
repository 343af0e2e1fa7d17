//! Content-addressed blob cache for protodist.
//!
//! Blobs are stored by SHA-256 digest under a two-character fan-out prefix:
//!
//! ```text
//! <root>/oras/
//!   ab/
//!     abcdef123456...   (blob, named by its full hex digest)
//! ```
//!
//! Inserts are atomic: writers stream into a `.partial.<pid>.<rand>` sibling,
//! fsync, then rename onto the final name. Concurrent writers for the same
//! digest produce identical bytes, so whichever rename lands last is
//! indistinguishable from the first. Readers see either absence or the
//! complete file; no lock files are involved.

pub mod metadata;

pub use metadata::{MetadataRecord, MetadataStore};

use rand::Rng;
use sha2::{Digest as _, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

use protodist_core::{Digest, Error, Result};

/// File mode for cached executables.
#[cfg(unix)]
const MODE_EXECUTABLE: u32 = 0o755;
/// File mode for cached data blobs.
#[cfg(unix)]
const MODE_DATA: u32 = 0o644;

/// One entry in the cache, as reported by [`DigestCache::entries`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The blob's digest.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: u64,
    /// Last-modified time of the cached file.
    pub mtime: SystemTime,
    /// Path of the cached file.
    pub path: PathBuf,
}

/// Content-addressed blob cache.
///
/// Shared by all in-process callers and by cooperating processes on the same
/// host; the atomic-rename insert protocol is the only coordination.
#[derive(Debug, Clone)]
pub struct DigestCache {
    root: PathBuf,
}

impl DigestCache {
    /// Create a cache rooted at the given blob directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The blob directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The canonical path for a digest.
    #[must_use]
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.prefix()).join(digest.hex())
    }

    /// Look up a blob. Pure `stat`; no I/O beyond that.
    #[must_use]
    pub fn lookup(&self, digest: &Digest) -> Option<PathBuf> {
        let path = self.path_for(digest);
        if path.is_file() {
            trace!(digest = %digest.short(), "Cache hit");
            Some(path)
        } else {
            trace!(digest = %digest.short(), "Cache miss");
            None
        }
    }

    /// Insert a file into the cache under its digest.
    ///
    /// The source is streamed into a partial file (hashing as it goes),
    /// fsynced, and renamed onto the canonical path. `executable` selects the
    /// file mode (0755 vs 0644 on Unix).
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityMismatch`] if the source bytes do not hash
    /// to `digest`, or an I/O error if the copy fails.
    pub fn insert(&self, source: &Path, digest: &Digest, executable: bool) -> Result<PathBuf> {
        let dest = self.path_for(digest);
        if dest.is_file() {
            // Identical bytes by digest equality; nothing to do.
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let partial = partial_path(&dest);
        let result = self.write_partial(source, digest, &partial, executable);
        match result {
            Ok(()) => {
                fs::rename(&partial, &dest)?;
                debug!(digest = %digest.short(), path = ?dest, "Inserted blob");
                Ok(dest)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e)
            }
        }
    }

    /// Insert in-memory bytes into the cache under their digest.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub fn insert_bytes(&self, data: &[u8], executable: bool) -> Result<(Digest, PathBuf)> {
        let digest = Digest::from_bytes(data);
        let dest = self.path_for(&digest);
        if dest.is_file() {
            return Ok((digest, dest));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = partial_path(&dest);
        {
            let mut file = fs::File::create(&partial)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        set_mode(&partial, executable)?;
        fs::rename(&partial, &dest)?;
        debug!(digest = %digest.short(), path = ?dest, "Inserted blob from memory");
        Ok((digest, dest))
    }

    /// Re-hash a cached blob and compare against its digest.
    ///
    /// On mismatch the file is deleted and a fatal integrity error returned;
    /// a subsequent resolve refetches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the blob is absent and
    /// [`Error::IntegrityMismatch`] if the content has been corrupted.
    pub fn verify(&self, digest: &Digest) -> Result<()> {
        let path = self.path_for(digest);
        if !path.is_file() {
            return Err(Error::not_found(format!("cached blob {digest}")));
        }
        let actual = Digest::from_file(&path)?;
        if actual != *digest {
            warn!(
                expected = %digest,
                actual = %actual,
                ?path,
                "Corrupted cache entry removed"
            );
            fs::remove_file(&path)?;
            return Err(Error::integrity_mismatch(
                digest.as_str(),
                actual.as_str(),
            ));
        }
        Ok(())
    }

    /// Remove every entry the predicate selects. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if directory traversal or unlinking fails.
    pub fn evict(&self, predicate: impl Fn(&CacheEntry) -> bool) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if predicate(&entry) {
                fs::remove_file(&entry.path)?;
                removed += 1;
            }
        }
        debug!(removed, "Evicted cache entries");
        Ok(removed)
    }

    /// Remove entries older than the given number of days.
    ///
    /// `None` removes everything. Orphaned partial files left by crashed
    /// writers are swept on the same pass. Returns the count of blobs
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error if traversal or unlinking fails.
    pub fn clear_older_than(&self, days: Option<u64>) -> Result<usize> {
        let cutoff = days.map(|d| SystemTime::now() - std::time::Duration::from_secs(d * 86_400));
        self.sweep_partials(cutoff)?;
        self.evict(|entry| cutoff.is_none_or(|c| entry.mtime < c))
    }

    /// List every entry currently in the cache.
    ///
    /// Leftover partial files from crashed writers are not entries; they are
    /// swept by [`Self::clear_older_than`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory walk fails.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if !self.root.exists() {
            return Ok(entries);
        }
        for entry in walkdir::WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::internal(format!("cache walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Ok(digest) = Digest::parse(&format!("sha256:{name}")) else {
                continue;
            };
            let meta = entry.metadata().map_err(|e| {
                Error::internal(format!("cache stat failed for {name}: {e}"))
            })?;
            entries.push(CacheEntry {
                digest,
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path: entry.into_path(),
            });
        }
        Ok(entries)
    }

    fn sweep_partials(&self, cutoff: Option<SystemTime>) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::internal(format!("cache walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.contains(".partial.") {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if cutoff.is_none_or(|c| mtime < c) {
                warn!(path = ?entry.path(), "Removing orphaned partial file");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn write_partial(
        &self,
        source: &Path,
        digest: &Digest,
        partial: &Path,
        executable: bool,
    ) -> Result<()> {
        let mut reader = fs::File::open(source)?;
        let mut writer = fs::File::create(partial)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            writer.write_all(&buffer[..n])?;
        }
        writer.sync_all()?;
        drop(writer);

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != digest.as_str() {
            return Err(Error::integrity_mismatch(digest.as_str(), actual));
        }
        set_mode(partial, executable)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let pid = std::process::id();
    let nonce: u32 = rand::rng().random();
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob");
    dest.with_file_name(format!("{name}.partial.{pid}.{nonce:08x}"))
}

#[cfg(unix)]
fn set_mode(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { MODE_EXECUTABLE } else { MODE_DATA };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> (TempDir, DigestCache) {
        let tmp = TempDir::new().unwrap();
        let cache = DigestCache::new(tmp.path().join("oras"));
        (tmp, cache)
    }

    fn write_source(dir: &Path, data: &[u8]) -> (PathBuf, Digest) {
        let path = dir.join("source");
        fs::write(&path, data).unwrap();
        (path, Digest::from_bytes(data))
    }

    #[test]
    fn test_insert_and_lookup() {
        let (tmp, cache) = cache();
        let (source, digest) = write_source(tmp.path(), b"artifact bytes");

        assert!(cache.lookup(&digest).is_none());
        let path = cache.insert(&source, &digest, false).unwrap();
        assert_eq!(cache.lookup(&digest), Some(path.clone()));
        assert_eq!(fs::read(&path).unwrap(), b"artifact bytes");

        // Fan-out prefix directory in the path.
        assert!(path.parent().unwrap().ends_with(digest.prefix()));
    }

    #[test]
    fn test_insert_rejects_digest_mismatch() {
        let (tmp, cache) = cache();
        let (source, _) = write_source(tmp.path(), b"actual bytes");
        let wrong = Digest::from_bytes(b"other bytes");

        let err = cache.insert(&source, &wrong, false).unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::IntegrityMismatch);
        // Nothing left behind, partial or final.
        assert!(cache.lookup(&wrong).is_none());
        assert_eq!(cache.entries().unwrap().len(), 0);
    }

    #[test]
    fn test_insert_idempotent() {
        let (tmp, cache) = cache();
        let (source, digest) = write_source(tmp.path(), b"same");
        let p1 = cache.insert(&source, &digest, false).unwrap();
        let p2 = cache.insert(&source, &digest, false).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(cache.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_zero_byte_blob() {
        let (tmp, cache) = cache();
        let (source, digest) = write_source(tmp.path(), b"");
        let path = cache.insert(&source, &digest, false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        cache.verify(&digest).unwrap();
    }

    #[test]
    fn test_parallel_inserts_same_digest() {
        let (tmp, cache) = cache();
        let data = b"raced bytes".to_vec();
        let digest = Digest::from_bytes(&data);

        let mut handles = Vec::new();
        for i in 0..4 {
            let cache = cache.clone();
            let digest = digest.clone();
            let src = tmp.path().join(format!("src{i}"));
            fs::write(&src, &data).unwrap();
            handles.push(std::thread::spawn(move || {
                cache.insert(&src, &digest, false).unwrap()
            }));
        }
        let paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(paths.iter().all(|p| *p == paths[0]));

        // Exactly one file, no partials left behind.
        assert_eq!(cache.entries().unwrap().len(), 1);
        let dir = paths[0].parent().unwrap();
        for entry in fs::read_dir(dir).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().contains(".partial."));
        }
        cache.verify(&digest).unwrap();
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (tmp, cache) = cache();
        let (source, digest) = write_source(tmp.path(), b"pristine");
        let path = cache.insert(&source, &digest, false).unwrap();

        // Flip bits on disk behind the cache's back.
        fs::write(&path, b"tampered").unwrap();
        let err = cache.verify(&digest).unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::IntegrityMismatch);

        // The bad entry is gone; a later resolve refetches.
        assert!(cache.lookup(&digest).is_none());
    }

    #[test]
    fn test_verify_missing_blob() {
        let (_tmp, cache) = cache();
        let digest = Digest::from_bytes(b"never inserted");
        let err = cache.verify(&digest).unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (tmp, cache) = cache();
        let (source, digest) = write_source(tmp.path(), b"#!/bin/sh\n");
        let path = cache.insert(&source, &digest, true).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);

        let (source2, digest2) = write_source(tmp.path(), b"data");
        let path2 = cache.insert(&source2, &digest2, false).unwrap();
        let mode2 = fs::metadata(&path2).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode2, 0o644);
    }

    #[test]
    fn test_insert_bytes() {
        let (_tmp, cache) = cache();
        let (digest, path) = cache.insert_bytes(b"in memory", false).unwrap();
        assert_eq!(digest, Digest::from_bytes(b"in memory"));
        assert_eq!(fs::read(path).unwrap(), b"in memory");
    }

    #[test]
    fn test_evict_by_predicate() {
        let (_tmp, cache) = cache();
        let (small, _) = cache.insert_bytes(b"s", false).unwrap();
        let (_big, _) = cache.insert_bytes(b"a much larger payload", false).unwrap();

        let removed = cache.evict(|e| e.size < 5).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.lookup(&small).is_none());
        assert_eq!(cache.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_all() {
        let (_tmp, cache) = cache();
        cache.insert_bytes(b"one", false).unwrap();
        cache.insert_bytes(b"two", false).unwrap();
        assert_eq!(cache.clear_older_than(None).unwrap(), 2);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn test_clear_older_than_keeps_recent() {
        let (_tmp, cache) = cache();
        cache.insert_bytes(b"fresh", false).unwrap();
        // A 30-day cutoff keeps files written just now.
        assert_eq!(cache.clear_older_than(Some(30)).unwrap(), 0);
        assert_eq!(cache.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_entries_empty_root() {
        let tmp = TempDir::new().unwrap();
        let cache = DigestCache::new(tmp.path().join("nonexistent"));
        assert!(cache.entries().unwrap().is_empty());
    }
}
