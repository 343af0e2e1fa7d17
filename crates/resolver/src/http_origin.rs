//! Pinned-URL HTTP origin strategy.
//!
//! Downloads a release archive from its pinned upstream URL, verifies the
//! archive against its pinned SHA-256, extracts the named member, and
//! inserts it into the content-addressed cache.

use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::Duration;
use tar::Archive;
use tracing::{debug, info};

use protodist_cas::DigestCache;
use protodist_core::{Digest, Error, Result};

use crate::table::PinnedArtifact;

/// Overall deadline for one origin download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP origin downloader.
pub struct HttpOrigin {
    http: reqwest::Client,
}

impl HttpOrigin {
    /// Create a downloader.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("protodist")
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Download, verify, unpack, and cache a pinned artifact.
    ///
    /// Returns the digest and cache path of the extracted binary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityMismatch`] when the archive does not hash
    /// to its pin, transport errors for network failures, and
    /// [`Error::NotFound`] when the member is missing from the archive.
    pub async fn fetch(
        &self,
        artifact: &PinnedArtifact,
        cache: &DigestCache,
    ) -> Result<(Digest, PathBuf)> {
        debug!(url = artifact.origin_url, "Downloading from origin");
        let response = self
            .http
            .get(artifact.origin_url)
            .send()
            .await
            .map_err(|e| map_error(&e))?;
        if response.status().as_u16() == 404 {
            return Err(Error::not_found(artifact.origin_url.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::transport(format!(
                "origin returned HTTP {} for {}",
                response.status(),
                artifact.origin_url
            )));
        }
        let data = response.bytes().await.map_err(|e| map_error(&e))?;

        let archive_digest = Digest::from_bytes(&data);
        if archive_digest.as_str() != artifact.origin_sha256 {
            return Err(Error::integrity_mismatch(
                artifact.origin_sha256,
                archive_digest.as_str(),
            ));
        }

        let binary = extract_member(artifact.origin_url, &data, artifact.archive_member)?;
        let (digest, path) = cache.insert_bytes(&binary, true)?;
        info!(
            tool = artifact.tool,
            version = artifact.version,
            digest = %digest.short(),
            "Fetched from origin"
        );
        Ok((digest, path))
    }
}

fn map_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout("origin download", DOWNLOAD_TIMEOUT.as_secs())
    } else {
        Error::transport(format!("origin download failed: {e}"))
    }
}

/// Extract a member from an archive, dispatching on the URL suffix.
///
/// Entry names match on exact path or trailing path, so archives that nest
/// everything under a top-level directory still resolve.
fn extract_member(url: &str, data: &[u8], member: &str) -> Result<Vec<u8>> {
    if url.ends_with(".zip") {
        extract_from_zip(data, member)
    } else if url.ends_with(".tar.gz") || url.ends_with(".tgz") {
        extract_from_tar_gz(data, member)
    } else {
        // A bare binary download.
        Ok(data.to_vec())
    }
}

fn matches_member(entry: &str, member: &str) -> bool {
    let entry = entry.trim_start_matches("./");
    entry == member || entry.ends_with(&format!("/{member}"))
}

fn extract_from_zip(data: &[u8], member: &str) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| Error::protocol(format!("failed to open zip archive: {e}")))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::protocol(format!("failed to read zip entry: {e}")))?;
        if matches_member(file.name(), member) {
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(Error::not_found(format!("member '{member}' in zip archive")))
}

fn extract_from_tar_gz(data: &[u8], member: &str) -> Result<Vec<u8>> {
    let decoder = GzDecoder::new(Cursor::new(data));
    let mut archive = Archive::new(decoder);
    for entry in archive
        .entries()
        .map_err(|e| Error::protocol(format!("failed to read tar archive: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| Error::protocol(format!("failed to read tar entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::protocol(format!("invalid path in tar: {e}")))?
            .to_string_lossy()
            .to_string();
        if matches_member(&path, member) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(Error::not_found(format!("member '{member}' in tar archive")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    pub(crate) fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in files {
                writer.start_file(*name, options).unwrap();
                std::io::Write::write_all(&mut writer, content).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    pub(crate) fn build_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_extract_zip_member() {
        let zip = build_zip(&[("readme.txt", b"hi"), ("bin/protoc", b"protoc-elf")]);
        let content = extract_from_zip(&zip, "bin/protoc").unwrap();
        assert_eq!(content, b"protoc-elf");
    }

    #[test]
    fn test_extract_zip_member_nested_root() {
        let zip = build_zip(&[("protoc-31.1/bin/protoc", b"protoc-elf")]);
        let content = extract_from_zip(&zip, "bin/protoc").unwrap();
        assert_eq!(content, b"protoc-elf");
    }

    #[test]
    fn test_extract_zip_missing_member() {
        let zip = build_zip(&[("readme.txt", b"hi")]);
        let err = extract_from_zip(&zip, "bin/protoc").unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::NotFound);
    }

    #[test]
    fn test_extract_tar_gz_member() {
        let tar = build_tar_gz(&[("buf/bin/buf", b"buf-elf")]);
        let content = extract_from_tar_gz(&tar, "bin/buf").unwrap();
        assert_eq!(content, b"buf-elf");
    }

    #[test]
    fn test_extract_dispatch_raw() {
        let content = extract_member("https://example.org/tool", b"raw-binary", "tool").unwrap();
        assert_eq!(content, b"raw-binary");
    }

    #[test]
    fn test_matches_member() {
        assert!(matches_member("bin/protoc", "bin/protoc"));
        assert!(matches_member("./bin/protoc", "bin/protoc"));
        assert!(matches_member("protoc-31.1/bin/protoc", "bin/protoc"));
        assert!(!matches_member("bin/protoc-gen-grpc", "bin/protoc"));
        assert!(!matches_member("sbin/protoc", "bin/protoc"));
    }
}
