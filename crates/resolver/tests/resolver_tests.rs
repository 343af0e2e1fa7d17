//! End-to-end resolver scenarios against mock registry and origin servers.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use protodist_core::{Arch, ArtifactRef, CacheLayout, Digest, ErrorKind, Os, Platform};
use protodist_credentials::CredentialStore;
use protodist_installers::PackageManager;
use protodist_registry::manifest::{annotations, Descriptor, Manifest, FILE_MEDIA_TYPE};
use protodist_registry::RegistryClient;
use protodist_resolver::{PinnedArtifact, ResolveRequest, Resolver, Tool};

const PLATFORM: Platform = Platform {
    os: Os::Linux,
    arch: Arch::X86_64,
};

fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

struct Fixture {
    registry_server: MockServer,
    origin_server: MockServer,
    resolver: Resolver,
    _tmp: tempfile::TempDir,
}

/// Build a resolver whose table has exactly one protoc entry pointing at the
/// mock servers. `blob` is what the OCI registry's layer should contain;
/// `zip_payload` is what the origin archive's bin/protoc member contains.
async fn fixture(blob: &[u8], zip_payload: &[u8]) -> (Fixture, Vec<u8>, Vec<u8>) {
    let tmp = tempfile::TempDir::new().unwrap();
    let layout = CacheLayout::new(tmp.path().join("cache"));
    let registry_server = MockServer::start().await;
    let origin_server = MockServer::start().await;
    let registry_host = registry_server.uri().trim_start_matches("http://").to_string();

    let zip_bytes = build_zip(&[("bin/protoc", zip_payload)]);
    let artifact = PinnedArtifact {
        tool: "protoc",
        version: "31.1",
        platform_suffix: "linux-amd64",
        repository: "buck2-protobuf/tools/protoc",
        digest: leak(Digest::from_bytes(blob).to_string()),
        origin_url: leak(format!("{}/protoc-31.1-linux-x86_64.zip", origin_server.uri())),
        origin_sha256: leak(Digest::from_bytes(&zip_bytes).to_string()),
        archive_member: "bin/protoc",
    };

    let credentials = CredentialStore::at(tmp.path().join("credentials"))
        .with_netrc_path(tmp.path().join("netrc"));
    let client = RegistryClient::new(credentials).unwrap().with_plain_http();
    let resolver = Resolver::with_parts(&layout, client, Vec::new())
        .unwrap()
        .with_registry_host(registry_host)
        .with_table(vec![artifact]);

    let manifest_body = {
        let layer = Descriptor::for_bytes(FILE_MEDIA_TYPE, blob)
            .with_annotation(annotations::TITLE, "protoc");
        Manifest::new(vec![layer], BTreeMap::new()).to_json().unwrap()
    };

    (
        Fixture {
            registry_server,
            origin_server,
            resolver,
            _tmp: tmp,
        },
        manifest_body,
        zip_bytes,
    )
}

fn request() -> ResolveRequest {
    ResolveRequest::for_platform(Tool::Protoc, "31.1", PLATFORM)
}

#[tokio::test]
async fn cold_pull_then_warm_pull() {
    let blob = b"protoc binary v31.1";
    let (fx, manifest_body, _zip) = fixture(blob, blob).await;
    let blob_digest = Digest::from_bytes(blob);

    Mock::given(method("GET"))
        .and(path(
            "/v2/buck2-protobuf/tools/protoc/manifests/31.1-linux-amd64",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest_body))
        .mount(&fx.registry_server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/buck2-protobuf/tools/protoc/blobs/{blob_digest}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.to_vec()))
        .mount(&fx.registry_server)
        .await;

    let first = fx.resolver.resolve(&request()).await.unwrap();
    assert_eq!(std::fs::read(&first).unwrap(), blob);

    let network_after_first = fx.resolver.metrics().network_calls;
    let second = fx.resolver.resolve(&request()).await.unwrap();
    assert_eq!(first, second);

    // Warm resolve touched the network zero times.
    let snap = fx.resolver.metrics();
    assert_eq!(snap.network_calls, network_after_first);
    assert_eq!(snap.memo.hits, 1);
    assert_eq!(snap.oci.hits, 1);
}

#[tokio::test]
async fn integrity_mismatch_is_fatal_and_leaves_nothing() {
    let blob = b"authentic protoc";
    let (fx, manifest_body, _zip) = fixture(blob, blob).await;
    let blob_digest = Digest::from_bytes(blob);

    Mock::given(method("GET"))
        .and(path(
            "/v2/buck2-protobuf/tools/protoc/manifests/31.1-linux-amd64",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest_body))
        .mount(&fx.registry_server)
        .await;
    // The registry lies: served bytes differ from the manifest digest.
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/buck2-protobuf/tools/protoc/blobs/{blob_digest}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"evil bytes".to_vec()))
        .mount(&fx.registry_server)
        .await;

    let err = fx.resolver.resolve(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);

    // No fallback happened and no blob was cached.
    assert_eq!(fx.resolver.metrics().http.samples, 0);
    assert!(fx.resolver.cache().entries().unwrap().is_empty());
}

#[tokio::test]
async fn fallback_cascade_oci_miss_http_hit() {
    let payload = b"protoc from origin";
    let (fx, _manifest, zip_bytes) = fixture(payload, payload).await;

    // OCI has nothing; the origin serves a correct archive.
    Mock::given(method("GET"))
        .and(path(
            "/v2/buck2-protobuf/tools/protoc/manifests/31.1-linux-amd64",
        ))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fx.registry_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/protoc-31.1-linux-x86_64.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(zip_bytes))
        .mount(&fx.origin_server)
        .await;

    let path = fx.resolver.resolve(&request()).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), payload);

    let snap = fx.resolver.metrics();
    assert_eq!(snap.package_manager.hits, 0);
    assert_eq!(snap.oci.hits, 0);
    assert_eq!(snap.oci.misses, 1);
    assert_eq!(snap.http.hits, 1);

    // The HTTP strategy recorded the resolution like any other strategy.
    let artifact_ref = ArtifactRef::tagged(
        fx.registry_server.uri().trim_start_matches("http://"),
        "buck2-protobuf/tools/protoc",
        "31.1-linux-amd64",
    )
    .unwrap();
    assert!(fx.resolver.metadata().contains(&artifact_ref));
}

#[tokio::test]
async fn corrupted_origin_archive_is_integrity_error() {
    let payload = b"protoc from origin";
    let (fx, _manifest, _zip) = fixture(payload, payload).await;

    Mock::given(method("GET"))
        .and(path(
            "/v2/buck2-protobuf/tools/protoc/manifests/31.1-linux-amd64",
        ))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fx.registry_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/protoc-31.1-linux-x86_64.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not the pinned zip".to_vec()))
        .mount(&fx.origin_server)
        .await;

    let err = fx.resolver.resolve(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);
}

#[tokio::test]
async fn parallel_identical_requests_share_one_cache_entry() {
    let blob = b"buf-style parallel payload";
    let (fx, manifest_body, _zip) = fixture(blob, blob).await;
    let blob_digest = Digest::from_bytes(blob);

    Mock::given(method("GET"))
        .and(path(
            "/v2/buck2-protobuf/tools/protoc/manifests/31.1-linux-amd64",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest_body))
        .mount(&fx.registry_server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/buck2-protobuf/tools/protoc/blobs/{blob_digest}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.to_vec()))
        .mount(&fx.registry_server)
        .await;

    let resolver = Arc::new(fx.resolver);
    let a = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.resolve(&request()).await.unwrap() })
    };
    let b = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.resolve(&request()).await.unwrap() })
    };
    let (path_a, path_b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(path_a, path_b);

    // Exactly one cached file and no leftover partials.
    assert_eq!(resolver.cache().entries().unwrap().len(), 1);
    let shard_dir = path_a.parent().unwrap();
    for entry in std::fs::read_dir(shard_dir).unwrap() {
        let name = entry.unwrap().file_name();
        assert!(!name.to_string_lossy().contains(".partial."));
    }
}

#[tokio::test]
async fn unsupported_version_fails_fast() {
    let (fx, _manifest, _zip) = fixture(b"x", b"x").await;
    let bad = ResolveRequest::for_platform(Tool::Protoc, "9.9.9", PLATFORM);
    let err = fx.resolver.resolve(&bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert!(err.to_string().contains("31.1"));
    // Nothing was attempted over the network.
    assert_eq!(fx.resolver.metrics().network_calls, 0);
}

#[tokio::test]
async fn auth_required_does_not_fall_through() {
    let payload = b"private tool";
    let (fx, _manifest, _zip) = fixture(payload, payload).await;

    Mock::given(method("GET"))
        .and(path(
            "/v2/buck2-protobuf/tools/protoc/manifests/31.1-linux-amd64",
        ))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Basic realm=\"registry\""),
        )
        .mount(&fx.registry_server)
        .await;

    let err = temp_env::async_with_vars(
        [
            ("ORAS_PASSWORD", None::<&str>),
            ("ORAS_USERNAME", None),
            ("BSR_TOKEN", None),
            ("PROTODIST_SERVICE_ACCOUNT_FILE", None),
        ],
        async { fx.resolver.resolve(&request()).await.unwrap_err() },
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::AuthRequired);
    // The HTTP origin was never consulted.
    assert_eq!(fx.resolver.metrics().http.samples, 0);
}

/// A stub manager that claims support and installs by touching a file.
struct StubManager {
    root: std::path::PathBuf,
}

#[async_trait::async_trait]
impl PackageManager for StubManager {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn available(&self) -> bool {
        true
    }

    fn supports(&self, tool: &str) -> bool {
        tool == "protoc-gen-stub"
    }

    async fn install(
        &self,
        spec: &protodist_installers::PluginSpec,
    ) -> protodist_core::Result<protodist_installers::InstallOutcome> {
        let path = self.root.join(format!("{}-{}", spec.name, spec.version));
        std::fs::write(&path, b"#!/bin/sh\n")?;
        Ok(protodist_installers::InstallOutcome {
            binary_path: path,
            wrapper_path: None,
        })
    }

    async fn uninstall(
        &self,
        _spec: &protodist_installers::PluginSpec,
    ) -> protodist_core::Result<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn unknown_bundle_is_not_found() {
    let (fx, _manifest, _zip) = fixture(b"x", b"x").await;
    let err = fx
        .resolver
        .resolve_bundle("no-such-bundle", PLATFORM)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn bundle_failure_returns_no_partial_result() {
    // With no installers and no table entries for plugins, the first member
    // fails and the bundle yields an error rather than a partial map.
    let (fx, _manifest, _zip) = fixture(b"x", b"x").await;
    assert!(fx.resolver.resolve_bundle("rust-grpc", PLATFORM).await.is_err());
}

#[tokio::test]
async fn package_manager_strategy_wins_for_plugins() {
    let tmp = tempfile::TempDir::new().unwrap();
    let layout = CacheLayout::new(tmp.path().join("cache"));
    let credentials = CredentialStore::at(tmp.path().join("credentials"))
        .with_netrc_path(tmp.path().join("netrc"));
    let client = RegistryClient::new(credentials).unwrap();
    let resolver = Resolver::with_parts(
        &layout,
        client,
        vec![Arc::new(StubManager {
            root: tmp.path().to_path_buf(),
        })],
    )
    .unwrap();

    let req = ResolveRequest::for_platform(
        Tool::Plugin("protoc-gen-stub".into()),
        "1.0.0",
        PLATFORM,
    );
    let path = resolver.resolve(&req).await.unwrap();
    assert!(path.ends_with("protoc-gen-stub-1.0.0"));

    let snap = resolver.metrics();
    assert_eq!(snap.package_manager.hits, 1);
    assert_eq!(snap.network_calls, 0);

    // The second resolve is memoised.
    let again = resolver.resolve(&req).await.unwrap();
    assert_eq!(path, again);
    assert_eq!(resolver.metrics().memo.hits, 1);
}
