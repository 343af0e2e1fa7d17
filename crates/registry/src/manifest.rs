//! OCI image manifest model.
//!
//! Only the fields protodist produces and consumes are modelled; unknown
//! fields are rejected nowhere (registries decorate manifests freely) but
//! are not preserved on round-trips.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use protodist_core::{Digest, Error, Result};

/// Manifest media type (OCI image manifest v1).
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// Artifact type for protodist-published artifacts.
pub const ARTIFACT_TYPE: &str = "application/vnd.protodist.artifact.v1";
/// Layer media type: one opaque file per layer.
pub const FILE_MEDIA_TYPE: &str = "application/vnd.protodist.file.v1";
/// Config media type; the config body is an empty JSON object.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.protodist.config.v1+json";
/// The canonical empty config body.
pub const EMPTY_CONFIG: &[u8] = b"{}";

/// Annotation keys with semantics.
pub mod annotations {
    /// Logical file name to restore on pull.
    pub const TITLE: &str = "org.opencontainers.image.title";
    /// Human-readable version.
    pub const VERSION: &str = "org.opencontainers.image.version";
    /// Creation timestamp (RFC 3339).
    pub const CREATED: &str = "org.opencontainers.image.created";
    /// Upstream source URL.
    pub const SOURCE: &str = "org.opencontainers.image.source";
    /// Platform selector (`os/arch`).
    pub const PLATFORM: &str = "io.protodist.platform";
    /// Layer role: `binary` or `schema`.
    pub const ROLE: &str = "io.protodist.role";
}

/// Role value marking an executable layer.
pub const ROLE_BINARY: &str = "binary";
/// Role value marking a schema-file layer.
pub const ROLE_SCHEMA: &str = "schema";

/// A content descriptor: one blob referenced from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    pub media_type: String,
    /// Blob size in bytes.
    pub size: u64,
    /// Blob digest.
    pub digest: Digest,
    /// Descriptor annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Build a descriptor for in-memory content.
    #[must_use]
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            size: data.len() as u64,
            digest: Digest::from_bytes(data),
            annotations: BTreeMap::new(),
        }
    }

    /// Attach an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// The title annotation, if present.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.annotations.get(annotations::TITLE).map(String::as_str)
    }

    /// The role annotation, if present.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.annotations.get(annotations::ROLE).map(String::as_str)
    }
}

/// An OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2.
    pub schema_version: u32,
    /// Always [`MANIFEST_MEDIA_TYPE`].
    pub media_type: String,
    /// Artifact type, present on protodist-published manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// The config descriptor.
    pub config: Descriptor,
    /// One descriptor per layer.
    pub layers: Vec<Descriptor>,
    /// Manifest-level annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Build a manifest over the given layers with the canonical empty
    /// config.
    #[must_use]
    pub fn new(layers: Vec<Descriptor>, annotations: BTreeMap<String, String>) -> Self {
        Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            artifact_type: Some(ARTIFACT_TYPE.to_string()),
            config: Descriptor::for_bytes(CONFIG_MEDIA_TYPE, EMPTY_CONFIG),
            layers,
            annotations,
        }
    }

    /// Parse manifest JSON, enforcing the fields we rely on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on malformed JSON or an unsupported
    /// schema version.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(data)
            .map_err(|e| Error::protocol(format!("malformed manifest: {e}")))?;
        if manifest.schema_version != 2 {
            return Err(Error::protocol(format!(
                "unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// Serialize to the canonical JSON bytes that get pushed and digested.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Select the single primary blob for a binary-style artifact.
    ///
    /// The layer whose title matches the executable name (with or without a
    /// Windows `.exe` suffix) or whose role is `binary` wins; otherwise a
    /// sole layer is the primary; multiple unmarked layers are a protocol
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if no primary layer can be chosen.
    pub fn primary_layer(&self, executable: Option<&str>) -> Result<&Descriptor> {
        if let Some(name) = executable {
            let exe_name = format!("{name}.exe");
            if let Some(layer) = self
                .layers
                .iter()
                .find(|l| l.title() == Some(name) || l.title() == Some(exe_name.as_str()))
            {
                return Ok(layer);
            }
        }
        if let Some(layer) = self.layers.iter().find(|l| l.role() == Some(ROLE_BINARY)) {
            return Ok(layer);
        }
        match self.layers.as_slice() {
            [sole] => Ok(sole),
            [] => Err(Error::protocol("manifest has no layers")),
            _ => Err(Error::protocol(
                "manifest has multiple layers and none is marked primary",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(title: &str, data: &[u8]) -> Descriptor {
        Descriptor::for_bytes(FILE_MEDIA_TYPE, data).with_annotation(annotations::TITLE, title)
    }

    #[test]
    fn test_manifest_json_field_names() {
        let manifest = Manifest::new(vec![layer("protoc", b"elf")], BTreeMap::new());
        let json = String::from_utf8(manifest.to_json().unwrap()).unwrap();
        assert!(json.contains("\"schemaVersion\": 2"));
        assert!(json.contains("\"mediaType\""));
        assert!(json.contains("\"artifactType\""));
        assert!(json.contains(MANIFEST_MEDIA_TYPE));
        assert!(json.contains("org.opencontainers.image.title"));
    }

    #[test]
    fn test_round_trip() {
        let mut annotations_map = BTreeMap::new();
        annotations_map.insert(annotations::VERSION.to_string(), "31.1".to_string());
        let manifest = Manifest::new(vec![layer("protoc", b"elf")], annotations_map);
        let parsed = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_from_json_rejects_bad_schema_version() {
        let mut manifest = Manifest::new(vec![layer("a", b"x")], BTreeMap::new());
        manifest.schema_version = 1;
        let json = serde_json::to_vec(&manifest).unwrap();
        let err = Manifest::from_json(&json).unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::ProtocolError);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(Manifest::from_json(b"not json").is_err());
        assert!(Manifest::from_json(b"{}").is_err());
    }

    #[test]
    fn test_empty_config_descriptor() {
        let manifest = Manifest::new(vec![], BTreeMap::new());
        assert_eq!(manifest.config.media_type, CONFIG_MEDIA_TYPE);
        assert_eq!(manifest.config.size, 2);
        assert_eq!(manifest.config.digest, Digest::from_bytes(EMPTY_CONFIG));
    }

    #[test]
    fn test_primary_layer_by_executable_name() {
        let manifest = Manifest::new(
            vec![layer("LICENSE", b"mit"), layer("protoc", b"elf")],
            BTreeMap::new(),
        );
        let primary = manifest.primary_layer(Some("protoc")).unwrap();
        assert_eq!(primary.title(), Some("protoc"));
    }

    #[test]
    fn test_primary_layer_exe_suffix() {
        let manifest = Manifest::new(
            vec![layer("LICENSE", b"mit"), layer("protoc.exe", b"pe")],
            BTreeMap::new(),
        );
        let primary = manifest.primary_layer(Some("protoc")).unwrap();
        assert_eq!(primary.title(), Some("protoc.exe"));
    }

    #[test]
    fn test_primary_layer_by_role() {
        let marked = Descriptor::for_bytes(FILE_MEDIA_TYPE, b"elf")
            .with_annotation(annotations::TITLE, "tool")
            .with_annotation(annotations::ROLE, ROLE_BINARY);
        let manifest = Manifest::new(vec![layer("README", b"hi"), marked], BTreeMap::new());
        let primary = manifest.primary_layer(None).unwrap();
        assert_eq!(primary.title(), Some("tool"));
    }

    #[test]
    fn test_primary_layer_sole() {
        let manifest = Manifest::new(vec![layer("a.proto", b"syntax")], BTreeMap::new());
        assert!(manifest.primary_layer(None).is_ok());
    }

    #[test]
    fn test_primary_layer_ambiguous() {
        let manifest = Manifest::new(
            vec![layer("a.proto", b"a"), layer("b.proto", b"b")],
            BTreeMap::new(),
        );
        let err = manifest.primary_layer(None).unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::ProtocolError);
    }

    #[test]
    fn test_primary_layer_empty() {
        let manifest = Manifest::new(vec![], BTreeMap::new());
        assert!(manifest.primary_layer(None).is_err());
    }

    #[test]
    fn test_descriptor_annotation_accessors() {
        let desc = Descriptor::for_bytes(FILE_MEDIA_TYPE, b"x")
            .with_annotation(annotations::TITLE, "buf")
            .with_annotation(annotations::ROLE, ROLE_BINARY);
        assert_eq!(desc.title(), Some("buf"));
        assert_eq!(desc.role(), Some(ROLE_BINARY));
    }
}
