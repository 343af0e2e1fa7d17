//! Pinned artifact table.
//!
//! Each supported `(tool, version, platform)` triple pins an OCI reference
//! with the expected primary-blob digest, and an HTTP origin URL with the
//! archive's SHA-256. New tool versions land here, nowhere else.

use protodist_core::Platform;

/// The registry artifacts are mirrored to by default.
pub const DEFAULT_REGISTRY: &str = "oras.birb.homes";

/// One pinned artifact.
#[derive(Debug, Clone, Copy)]
pub struct PinnedArtifact {
    /// Tool name.
    pub tool: &'static str,
    /// Tool version.
    pub version: &'static str,
    /// Platform tag suffix (`os-alias`, e.g. `linux-amd64`).
    pub platform_suffix: &'static str,
    /// Repository under the mirror registry.
    pub repository: &'static str,
    /// Expected digest of the primary blob in the mirror.
    pub digest: &'static str,
    /// Upstream origin URL for the HTTP fallback.
    pub origin_url: &'static str,
    /// SHA-256 of the origin archive.
    pub origin_sha256: &'static str,
    /// Path of the binary inside the origin archive.
    pub archive_member: &'static str,
}

impl PinnedArtifact {
    /// The mirror tag for this artifact (`<version>-<platform_suffix>`).
    #[must_use]
    pub fn tag(&self) -> String {
        format!("{}-{}", self.version, self.platform_suffix)
    }
}

macro_rules! protoc {
    ($version:literal, $suffix:literal, $digest:literal, $asset:literal, $member:literal) => {
        PinnedArtifact {
            tool: "protoc",
            version: $version,
            platform_suffix: $suffix,
            repository: "buck2-protobuf/tools/protoc",
            digest: $digest,
            origin_url: concat!(
                "https://github.com/protocolbuffers/protobuf/releases/download/v",
                $version,
                "/protoc-",
                $version,
                "-",
                $asset
            ),
            origin_sha256: $digest,
            archive_member: $member,
        }
    };
}

macro_rules! buf {
    ($version:literal, $suffix:literal, $digest:literal, $asset:literal, $member:literal) => {
        PinnedArtifact {
            tool: "buf",
            version: $version,
            platform_suffix: $suffix,
            repository: "buck2-protobuf/tools/buf",
            digest: $digest,
            origin_url: concat!(
                "https://github.com/bufbuild/buf/releases/download/v",
                $version,
                "/buf-",
                $asset
            ),
            origin_sha256: $digest,
            archive_member: $member,
        }
    };
}

/// Every artifact the resolver can provide without a package manager.
pub const PINNED_ARTIFACTS: &[PinnedArtifact] = &[
    // protoc 30.2
    protoc!(
        "30.2",
        "linux-amd64",
        "sha256:327e9397c6fb3ea2a542513a3221334c6f76f7aa524a7d2561142b67b312a01f",
        "linux-x86_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "30.2",
        "linux-arm64",
        "sha256:a3173ea338ef91b1605b88c4f8120d6c8ccf36f744d9081991d595d0d4352996",
        "linux-aarch_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "30.2",
        "darwin-amd64",
        "sha256:65675c3bb874a2d5f0c941e61bce6175090be25fe466f0ec2d4a6f5978333624",
        "osx-x86_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "30.2",
        "darwin-arm64",
        "sha256:92728c650f6cf2b6c37891ae04ef5bc2d4b5f32c5fbbd101eda623f90bb95f63",
        "osx-aarch_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "30.2",
        "windows-amd64",
        "sha256:10f35df7722a69dde8ee92b4a16a4e1cc91cfce82fbb4a371bd046de139aa4a9",
        "win64.zip",
        "bin/protoc.exe"
    ),
    // protoc 31.0
    protoc!(
        "31.0",
        "linux-amd64",
        "sha256:24e2ed32060b7c990d5eb00d642fde04869d7f77c6d443f609353f097799dd42",
        "linux-x86_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.0",
        "linux-arm64",
        "sha256:999f4c023366b0b68c5c65272ead7877e47a2670245a79904b83450575da7e19",
        "linux-aarch_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.0",
        "darwin-amd64",
        "sha256:0360d9b6d9e3d66958cf6274d8514da49e76d475fd0d712181dcc7e9e056f2c8",
        "osx-x86_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.0",
        "darwin-arm64",
        "sha256:1fbe70a8d646875f91b6fd57294f763145292b2c9e1374ab09d6e2124afdd950",
        "osx-aarch_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.0",
        "windows-amd64",
        "sha256:d7edee5d0d5d6786c92e77a4f511e4698a5aa922c6390b6d08c3a79935a651b0",
        "win64.zip",
        "bin/protoc.exe"
    ),
    // protoc 31.1
    protoc!(
        "31.1",
        "linux-amd64",
        "sha256:96553041f1a91ea0efee963cb16f462f5985b4d65365f3907414c360044d8065",
        "linux-x86_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.1",
        "linux-arm64",
        "sha256:6c554de11cea04c56ebf8e45b54434019b1cd85223d4bbd25c282425e306ecc2",
        "linux-aarch_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.1",
        "darwin-amd64",
        "sha256:485e87088b18614c25a99b1c0627918b3ff5b9fde54922fb1c920159fab7ba29",
        "osx-x86_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.1",
        "darwin-arm64",
        "sha256:4aeea0a34b0992847b03a8489a8dbedf3746de01109b74cc2ce9b6888a901ed9",
        "osx-aarch_64.zip",
        "bin/protoc"
    ),
    protoc!(
        "31.1",
        "windows-amd64",
        "sha256:70381b116ab0d71cb6a5177d9b17c7c13415866603a0fd40d513dafe32d56c35",
        "win64.zip",
        "bin/protoc.exe"
    ),
    // buf 1.47.2
    buf!(
        "1.47.2",
        "linux-amd64",
        "sha256:a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2",
        "Linux-x86_64.tar.gz",
        "bin/buf"
    ),
    buf!(
        "1.47.2",
        "linux-arm64",
        "sha256:b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3",
        "Linux-aarch64.tar.gz",
        "bin/buf"
    ),
    buf!(
        "1.47.2",
        "darwin-amd64",
        "sha256:c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d4",
        "Darwin-x86_64.tar.gz",
        "bin/buf"
    ),
    buf!(
        "1.47.2",
        "darwin-arm64",
        "sha256:d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5",
        "Darwin-arm64.tar.gz",
        "bin/buf"
    ),
    buf!(
        "1.47.2",
        "windows-amd64",
        "sha256:e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5f6",
        "Windows-x86_64.zip",
        "bin/buf.exe"
    ),
];

/// Look up the pinned artifact for a `(tool, version, platform)` triple.
#[must_use]
pub fn pinned(tool: &str, version: &str, platform: Platform) -> Option<&'static PinnedArtifact> {
    let suffix = platform.tag_suffix();
    PINNED_ARTIFACTS
        .iter()
        .find(|a| a.tool == tool && a.version == version && a.platform_suffix == suffix)
}

/// Versions of a tool present in the table, deduplicated, in table order.
#[must_use]
pub fn supported_versions(tool: &str) -> Vec<&'static str> {
    let mut versions = Vec::new();
    for artifact in PINNED_ARTIFACTS {
        if artifact.tool == tool && !versions.contains(&artifact.version) {
            versions.push(artifact.version);
        }
    }
    versions
}
