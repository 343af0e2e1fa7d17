//! OCI distribution client.
//!
//! Speaks enough of the distribution spec to pull named artifacts, push
//! manifests and blobs, list tags, and translate tags to digests. Every blob
//! that crosses the wire is digest-verified before anything consumes it.
//!
//! Auth follows the standard challenge flow: requests go out anonymous, a
//! 401 `WWW-Authenticate: Bearer` challenge triggers a token exchange using
//! the credential store, and the token is cached per registry for the rest
//! of the process.

use futures::StreamExt;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use protodist_cas::{DigestCache, MetadataRecord, MetadataStore};
use protodist_core::{ArtifactRef, Digest, Error, Result};
use protodist_credentials::{Credential, CredentialStore};

use crate::manifest::{Manifest, ROLE_BINARY, MANIFEST_MEDIA_TYPE};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Overall deadline for one pull.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(300);
/// Overall deadline for one push.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(600);

/// Additional attempts after the first for retryable failures.
const MAX_RETRIES: u32 = 3;
/// Base backoff delay, doubled per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// OCI registry client.
pub struct RegistryClient {
    http: reqwest::Client,
    credentials: CredentialStore,
    tokens: Mutex<HashMap<String, String>>,
    plain_http: bool,
}

impl RegistryClient {
    /// Create a client backed by the given credential store.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(credentials: CredentialStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("protodist")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            credentials,
            tokens: Mutex::new(HashMap::new()),
            plain_http: false,
        })
    }

    /// Talk plain HTTP instead of HTTPS. For local registries and tests.
    #[must_use]
    pub fn with_plain_http(mut self) -> Self {
        self.plain_http = true;
        self
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{scheme}://{registry}/v2")
    }

    /// Resolve a tag to the digest it currently refers to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown tags, auth errors per the
    /// challenge flow, or transport errors after retries.
    pub async fn resolve_tag(&self, artifact_ref: &ArtifactRef) -> Result<Digest> {
        let (_, digest) = self.fetch_manifest(artifact_ref).await?;
        Ok(digest)
    }

    /// Fetch and parse the manifest for a reference.
    ///
    /// For by-digest references the body is verified against the reference
    /// digest.
    ///
    /// # Errors
    ///
    /// Returns protocol errors for malformed manifests, integrity errors for
    /// digest mismatches, and transport errors after retries.
    pub async fn fetch_manifest(&self, artifact_ref: &ArtifactRef) -> Result<(Manifest, Digest)> {
        let reference = artifact_ref
            .tag()
            .map(String::from)
            .or_else(|| artifact_ref.digest().map(|d| d.to_string()))
            .unwrap_or_default();
        let url = format!(
            "{}/{}/manifests/{}",
            self.base_url(artifact_ref.registry()),
            artifact_ref.repository(),
            reference
        );

        let body = with_retry("fetch manifest", || async {
            let response = self
                .send(artifact_ref.registry(), || {
                    self.http
                        .get(&url)
                        .header("Accept", MANIFEST_MEDIA_TYPE)
                })
                .await?;
            self.check_status(artifact_ref.registry(), &url, response)
                .await?
                .bytes()
                .await
                .map_err(|e| map_reqwest_error("fetch manifest", &e))
        })
        .await?;

        let digest = Digest::from_bytes(&body);
        if let Some(expected) = artifact_ref.digest() {
            if *expected != digest {
                return Err(Error::integrity_mismatch(expected.as_str(), digest.as_str()));
            }
        }
        let manifest = Manifest::from_json(&body)?;
        trace!(artifact_ref = %artifact_ref, digest = %digest.short(), "Fetched manifest");
        Ok((manifest, digest))
    }

    /// Pull the primary blob of an artifact into the cache.
    ///
    /// `expected_digest` pins the primary blob; a manifest that disagrees is
    /// an integrity error before any download happens. `executable` names
    /// the binary to select among multiple layers and marks the cached file
    /// executable.
    ///
    /// Returns the cache path. A metadata sidecar is written for the
    /// reference, recording the digest a mutable tag resolved to.
    ///
    /// # Errors
    ///
    /// Returns the full error taxonomy of the client plus
    /// [`Error::Timeout`] if the pull exceeds its 300 s deadline.
    pub async fn pull(
        &self,
        artifact_ref: &ArtifactRef,
        expected_digest: Option<&Digest>,
        executable: Option<&str>,
        cache: &DigestCache,
        metadata: &MetadataStore,
    ) -> Result<PathBuf> {
        tokio::time::timeout(
            PULL_TIMEOUT,
            self.pull_inner(artifact_ref, expected_digest, executable, cache, metadata),
        )
        .await
        .map_err(|_| Error::timeout("pull", PULL_TIMEOUT.as_secs()))?
    }

    async fn pull_inner(
        &self,
        artifact_ref: &ArtifactRef,
        expected_digest: Option<&Digest>,
        executable: Option<&str>,
        cache: &DigestCache,
        metadata: &MetadataStore,
    ) -> Result<PathBuf> {
        // A pinned digest that is already cached needs no network at all.
        if let Some(expected) = expected_digest {
            if let Some(path) = cache.lookup(expected) {
                debug!(digest = %expected.short(), "Pull satisfied from cache");
                return Ok(path);
            }
        }

        let (manifest, manifest_digest) = self.fetch_manifest(artifact_ref).await?;
        let primary = manifest.primary_layer(executable)?.clone();

        if let Some(expected) = expected_digest {
            if primary.digest != *expected {
                return Err(Error::integrity_mismatch(
                    expected.as_str(),
                    primary.digest.as_str(),
                ));
            }
        }

        let path = match cache.lookup(&primary.digest) {
            Some(path) => path,
            None => {
                let is_binary = executable.is_some() || primary.role() == Some(ROLE_BINARY);
                self.download_blob_to_cache(artifact_ref, &primary.digest, is_binary, cache)
                    .await?
            }
        };

        let mut record =
            MetadataRecord::new(artifact_ref.clone(), primary.digest.clone(), primary.size);
        if let Some(title) = primary.title() {
            record = record.with_title(title);
        }
        metadata.write(&record)?;

        info!(
            artifact_ref = %artifact_ref,
            manifest = %manifest_digest.short(),
            blob = %primary.digest.short(),
            "Pulled artifact"
        );
        Ok(path)
    }

    /// Pull every layer of an artifact into a directory, restoring each
    /// layer to its title annotation.
    ///
    /// Returns the restored paths in layer order.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if any layer lacks a title, integrity errors
    /// on digest mismatches, and transport errors after retries.
    pub async fn pull_to_dir(
        &self,
        artifact_ref: &ArtifactRef,
        dest: &Path,
    ) -> Result<Vec<PathBuf>> {
        let (manifest, _) = self.fetch_manifest(artifact_ref).await?;
        let mut restored = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let Some(title) = layer.title() else {
                return Err(Error::protocol(format!(
                    "layer {} has no title annotation to restore to",
                    layer.digest.short()
                )));
            };
            let target = sanitize_join(dest, title)?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = self
                .fetch_blob_verified(artifact_ref.registry(), artifact_ref.repository(), &layer.digest)
                .await?;
            std::fs::write(&target, &data)?;
            restored.push(target);
        }
        Ok(restored)
    }

    /// List the tags currently bound in a repository.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown repositories and transport
    /// errors after retries.
    pub async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let url = format!("{}/{repository}/tags/list", self.base_url(registry));
        let body = with_retry("list tags", || async {
            let response = self.send(registry, || self.http.get(&url)).await?;
            self.check_status(registry, &url, response)
                .await?
                .bytes()
                .await
                .map_err(|e| map_reqwest_error("list tags", &e))
        })
        .await?;

        let list: TagList = serde_json::from_slice(&body)
            .map_err(|e| Error::protocol(format!("malformed tag list: {e}")))?;
        Ok(list.tags.unwrap_or_default())
    }

    /// Whether a blob already exists in a repository.
    ///
    /// # Errors
    ///
    /// Returns transport errors after retries.
    pub async fn blob_exists(
        &self,
        registry: &str,
        repository: &str,
        digest: &Digest,
    ) -> Result<bool> {
        let url = format!("{}/{repository}/blobs/{digest}", self.base_url(registry));
        with_retry("check blob", || async {
            let response = self.send(registry, || self.http.head(&url)).await?;
            match response.status().as_u16() {
                200 => Ok(true),
                404 => Ok(false),
                _ => Err(self.error_for_status(registry, &url, response).await),
            }
        })
        .await
    }

    /// Upload one blob via the monolithic upload flow.
    ///
    /// # Errors
    ///
    /// Returns auth errors per the challenge flow and transport errors after
    /// retries.
    pub async fn upload_blob(
        &self,
        registry: &str,
        repository: &str,
        digest: &Digest,
        data: &[u8],
    ) -> Result<()> {
        if self.blob_exists(registry, repository, digest).await? {
            trace!(digest = %digest.short(), "Blob already present, skipping upload");
            return Ok(());
        }
        let start_url = format!("{}/{repository}/blobs/uploads/", self.base_url(registry));
        with_retry("upload blob", || async {
            let response = self.send(registry, || self.http.post(&start_url)).await?;
            let response = self.error_unless(registry, &start_url, response, &[202]).await?;
            let location = response
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::protocol("upload start returned no Location"))?;
            let put_url = self.absolute_url(registry, location, digest);

            let response = self
                .send(registry, || {
                    self.http
                        .put(&put_url)
                        .header("Content-Type", "application/octet-stream")
                        .body(data.to_vec())
                })
                .await?;
            self.error_unless(registry, &put_url, response, &[201]).await?;
            Ok(())
        })
        .await?;
        debug!(digest = %digest.short(), repository, "Uploaded blob");
        Ok(())
    }

    /// Put a manifest under a tag or digest reference. Returns the manifest
    /// digest.
    ///
    /// # Errors
    ///
    /// Returns auth errors per the challenge flow and transport errors after
    /// retries.
    pub async fn put_manifest(
        &self,
        artifact_ref: &ArtifactRef,
        manifest: &Manifest,
    ) -> Result<Digest> {
        let body = manifest.to_json()?;
        let digest = Digest::from_bytes(&body);
        let reference = artifact_ref
            .tag()
            .map(String::from)
            .unwrap_or_else(|| digest.to_string());
        let url = format!(
            "{}/{}/manifests/{reference}",
            self.base_url(artifact_ref.registry()),
            artifact_ref.repository()
        );
        with_retry("put manifest", || async {
            let response = self
                .send(artifact_ref.registry(), || {
                    self.http
                        .put(&url)
                        .header("Content-Type", MANIFEST_MEDIA_TYPE)
                        .body(body.clone())
                })
                .await?;
            self.error_unless(artifact_ref.registry(), &url, response, &[201])
                .await?;
            Ok(())
        })
        .await?;
        info!(artifact_ref = %artifact_ref, digest = %digest.short(), "Put manifest");
        Ok(digest)
    }

    async fn download_blob_to_cache(
        &self,
        artifact_ref: &ArtifactRef,
        digest: &Digest,
        executable: bool,
        cache: &DigestCache,
    ) -> Result<PathBuf> {
        let url = format!(
            "{}/{}/blobs/{digest}",
            self.base_url(artifact_ref.registry()),
            artifact_ref.repository()
        );
        with_retry("download blob", || async {
            let response = self
                .send(artifact_ref.registry(), || self.http.get(&url))
                .await?;
            let response = self
                .check_status(artifact_ref.registry(), &url, response)
                .await?;

            // Stream to a scratch file, hashing as bytes arrive.
            let scratch_dir = cache.root().join("incoming");
            std::fs::create_dir_all(&scratch_dir)?;
            let scratch = scratch_dir.join(format!(
                "{}.partial.{}.download",
                digest.hex(),
                std::process::id()
            ));
            let mut file = std::fs::File::create(&scratch)?;
            let mut hasher = Sha256::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| map_reqwest_error("download blob", &e))?;
                hasher.update(&chunk);
                file.write_all(&chunk)?;
            }
            file.sync_all()?;
            drop(file);

            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
            if actual != digest.as_str() {
                let _ = std::fs::remove_file(&scratch);
                return Err(Error::integrity_mismatch(digest.as_str(), actual));
            }
            let path = cache.insert(&scratch, digest, executable)?;
            let _ = std::fs::remove_file(&scratch);
            Ok(path)
        })
        .await
    }

    async fn fetch_blob_verified(
        &self,
        registry: &str,
        repository: &str,
        digest: &Digest,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/{repository}/blobs/{digest}", self.base_url(registry));
        let body = with_retry("fetch blob", || async {
            let response = self.send(registry, || self.http.get(&url)).await?;
            self.check_status(registry, &url, response)
                .await?
                .bytes()
                .await
                .map_err(|e| map_reqwest_error("fetch blob", &e))
        })
        .await?;
        let actual = Digest::from_bytes(&body);
        if actual != *digest {
            return Err(Error::integrity_mismatch(digest.as_str(), actual.as_str()));
        }
        Ok(body.to_vec())
    }

    /// Send a request, answering at most one auth challenge.
    async fn send(
        &self,
        registry: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let cached_token = {
            let tokens = self.tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            tokens.get(registry).cloned()
        };

        let mut request = build();
        if let Some(token) = &cached_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error("request", &e))?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let credential = self.credentials.lookup(registry)?;

        match challenge {
            Some(header) if header.trim_start().starts_with("Bearer") => {
                let token = self
                    .exchange_token(registry, &header, credential.as_ref())
                    .await?;
                {
                    let mut tokens = self
                        .tokens
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    tokens.insert(registry.to_string(), token.clone());
                }
                let retried = build()
                    .bearer_auth(&token)
                    .send()
                    .await
                    .map_err(|e| map_reqwest_error("request", &e))?;
                Ok(retried)
            }
            _ => {
                // Basic challenge (or none): retry with the raw credential.
                let Some(credential) = credential else {
                    return Err(Error::auth_required(registry));
                };
                let retried = build()
                    .basic_auth(
                        credential.username.clone().unwrap_or_default(),
                        Some(credential.token.clone()),
                    )
                    .send()
                    .await
                    .map_err(|e| map_reqwest_error("request", &e))?;
                Ok(retried)
            }
        }
    }

    /// Exchange a bearer challenge for a token at the realm endpoint.
    async fn exchange_token(
        &self,
        registry: &str,
        challenge: &str,
        credential: Option<&Credential>,
    ) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }

        let params = parse_challenge(challenge);
        let Some(realm) = params.get("realm") else {
            return Err(Error::protocol("bearer challenge without realm"));
        };

        let mut request = self.http.get(realm.as_str());
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = params.get("scope") {
            request = request.query(&[("scope", scope)]);
        }
        if let Some(credential) = credential {
            request = request.basic_auth(
                credential.username.clone().unwrap_or_default(),
                Some(credential.token.clone()),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error("token exchange", &e))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(match credential {
                Some(c) => {
                    warn!(registry, token = %c.masked(), "Token exchange rejected credential");
                    Error::auth_failed(registry, "token exchange rejected the credential")
                }
                None => Error::auth_required(registry),
            });
        }
        if !response.status().is_success() {
            return Err(Error::protocol(format!(
                "token endpoint returned HTTP {}",
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::protocol(format!("malformed token response: {e}")))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Error::protocol("token response carried no token"))
    }

    /// Turn a non-success response into the matching error.
    async fn check_status(
        &self,
        registry: &str,
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(self.error_for_status(registry, url, response).await)
    }

    async fn error_unless(
        &self,
        registry: &str,
        url: &str,
        response: reqwest::Response,
        accepted: &[u16],
    ) -> Result<reqwest::Response> {
        if accepted.contains(&response.status().as_u16()) || response.status().is_success() {
            return Ok(response);
        }
        Err(self.error_for_status(registry, url, response).await)
    }

    async fn error_for_status(
        &self,
        registry: &str,
        url: &str,
        response: reqwest::Response,
    ) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = body.chars().take(200).collect::<String>();
        match status.as_u16() {
            401 => Error::auth_required(registry),
            403 => Error::auth_failed(registry, detail),
            404 => Error::not_found(url.to_string()),
            408 | 504 => Error::timeout("registry request", REQUEST_TIMEOUT.as_secs()),
            500..=599 => Error::transport(format!("registry returned HTTP {status}: {detail}")),
            _ => Error::protocol(format!("unexpected HTTP {status} from {url}: {detail}")),
        }
    }

    fn absolute_url(&self, registry: &str, location: &str, digest: &Digest) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        let base = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{scheme}://{registry}{location}")
        };
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}digest={digest}")
    }
}

/// Retry a fallible operation with exponential backoff.
///
/// Only transport failures and timeouts are retried; every other error kind
/// returns immediately.
async fn with_retry<T, F, Fut>(operation: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn map_reqwest_error(operation: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(operation.to_string(), REQUEST_TIMEOUT.as_secs())
    } else {
        Error::transport(format!("{operation} failed: {e}"))
    }
}

/// Parse a `WWW-Authenticate: Bearer k="v",...` challenge into its params.
fn parse_challenge(header: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let rest = header.trim_start().trim_start_matches("Bearer").trim();
    for part in rest.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// Join a layer title under a destination directory, rejecting traversal.
fn sanitize_join(dest: &Path, title: &str) -> Result<PathBuf> {
    let relative = Path::new(title);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::protocol(format!(
            "layer title '{title}' escapes the destination directory"
        )));
    }
    Ok(dest.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let params = parse_challenge(
            "Bearer realm=\"https://auth.example.org/token\",service=\"registry\",scope=\"repository:a/b:pull\"",
        );
        assert_eq!(
            params.get("realm").map(String::as_str),
            Some("https://auth.example.org/token")
        );
        assert_eq!(params.get("service").map(String::as_str), Some("registry"));
        assert_eq!(
            params.get("scope").map(String::as_str),
            Some("repository:a/b:pull")
        );
    }

    #[test]
    fn test_sanitize_join_rejects_traversal() {
        let dest = Path::new("/tmp/out");
        assert!(sanitize_join(dest, "../escape").is_err());
        assert!(sanitize_join(dest, "/etc/passwd").is_err());
        assert_eq!(
            sanitize_join(dest, "nested/a.proto").unwrap(),
            PathBuf::from("/tmp/out/nested/a.proto")
        );
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_fatal() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = with_retry("op", || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(Error::not_found("x"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_retries_transport() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry("op", || async {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                Err(Error::transport("flaky"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
