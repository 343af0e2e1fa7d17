//! Artifact reference parsing.
//!
//! A reference names an artifact in a registry, by tag or by digest:
//!
//! ```text
//! ref     = host [ ":" port ] "/" path ( ":" tag | "@" digest )
//! path    = segment ( "/" segment )*
//! segment = [a-z0-9]+ ( [-._] [a-z0-9]+ )*
//! tag     = [A-Za-z0-9_][A-Za-z0-9._-]{0,127}
//! ```
//!
//! Exactly one of tag or digest is present. Every component downstream
//! consumes the parsed value; nothing re-parses reference strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{Digest, Error, Result};

/// The mutable-or-pinned part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefTarget {
    /// A mutable tag.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

/// A parsed artifact reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    registry: String,
    repository: String,
    target: RefTarget,
}

impl ArtifactRef {
    /// Parse and validate a reference string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the string does not match the
    /// reference grammar.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = |why: &str| Error::config_invalid(format!("Invalid reference '{s}': {why}"));

        let (registry, rest) = s.split_once('/').ok_or_else(|| bad("missing repository"))?;
        validate_registry(registry).map_err(|why| bad(&why))?;

        // Digest references split at '@'; tag references at the last ':'
        // that is part of the path (the registry's port colon is gone by now).
        let (repository, target) = if let Some((repo, digest)) = rest.split_once('@') {
            (repo, RefTarget::Digest(Digest::parse(digest)?))
        } else if let Some((repo, tag)) = rest.rsplit_once(':') {
            validate_tag(tag).map_err(|why| bad(&why))?;
            (repo, RefTarget::Tag(tag.to_string()))
        } else {
            return Err(bad("missing tag or digest"));
        };

        if repository.is_empty() {
            return Err(bad("empty repository path"));
        }
        for segment in repository.split('/') {
            validate_segment(segment).map_err(|why| bad(&why))?;
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            target,
        })
    }

    /// Build a tagged reference from parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the assembled string does not parse.
    pub fn tagged(registry: &str, repository: &str, tag: &str) -> Result<Self> {
        Self::parse(&format!("{registry}/{repository}:{tag}"))
    }

    /// The registry host (with optional port).
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path within the registry.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if this reference is by tag.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match &self.target {
            RefTarget::Tag(t) => Some(t),
            RefTarget::Digest(_) => None,
        }
    }

    /// The digest, if this reference is by digest.
    #[must_use]
    pub fn digest(&self) -> Option<&Digest> {
        match &self.target {
            RefTarget::Tag(_) => None,
            RefTarget::Digest(d) => Some(d),
        }
    }

    /// The tag-or-digest target.
    #[must_use]
    pub fn target(&self) -> &RefTarget {
        &self.target
    }

    /// The same repository pinned to a digest.
    ///
    /// Used to record the digest a tag resolved to.
    #[must_use]
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            target: RefTarget::Digest(digest),
        }
    }

    /// A filesystem-safe rendering: every character outside
    /// `[A-Za-z0-9._-]` is replaced by `_`.
    #[must_use]
    pub fn safe_filename(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            RefTarget::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            RefTarget::Digest(d) => write!(f, "{}/{}@{}", self.registry, self.repository, d),
        }
    }
}

impl FromStr for ArtifactRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ArtifactRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn validate_registry(host: &str) -> std::result::Result<(), String> {
    let (name, port) = match host.split_once(':') {
        Some((n, p)) => (n, Some(p)),
        None => (host, None),
    };
    if name.is_empty() {
        return Err("empty registry host".to_string());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return Err(format!("invalid registry host '{name}'"));
    }
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid registry port '{port}'"));
        }
    }
    Ok(())
}

fn validate_segment(segment: &str) -> std::result::Result<(), String> {
    let err = || format!("invalid path segment '{segment}'");
    let mut prev_separator = true;
    for b in segment.bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => prev_separator = false,
            b'-' | b'.' | b'_' if !prev_separator => prev_separator = true,
            _ => return Err(err()),
        }
    }
    if segment.is_empty() || prev_separator {
        return Err(err());
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    let err = || format!("invalid tag '{tag}'");
    let mut bytes = tag.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphanumeric() || b == b'_' => {}
        _ => return Err(err()),
    }
    if tag.len() > 128 {
        return Err(err());
    }
    for b in bytes {
        if !(b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-') {
            return Err(err());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_tagged() {
        let r = ArtifactRef::parse("oras.birb.homes/buck2-protobuf/tools/protoc:31.1-linux-amd64")
            .unwrap();
        assert_eq!(r.registry(), "oras.birb.homes");
        assert_eq!(r.repository(), "buck2-protobuf/tools/protoc");
        assert_eq!(r.tag(), Some("31.1-linux-amd64"));
        assert!(r.digest().is_none());
    }

    #[test]
    fn test_parse_digest() {
        let r = ArtifactRef::parse(&format!("reg.example.org/acme/schemas@{DIGEST}")).unwrap();
        assert_eq!(r.digest().map(Digest::as_str), Some(DIGEST));
        assert!(r.tag().is_none());
    }

    #[test]
    fn test_parse_with_port() {
        let r = ArtifactRef::parse("localhost:5000/test/hello-world:latest").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "test/hello-world");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_parse_rejects_missing_target() {
        assert!(ArtifactRef::parse("reg.example.org/acme/schemas").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_segments() {
        assert!(ArtifactRef::parse("reg.example.org/Acme/schemas:v1").is_err());
        assert!(ArtifactRef::parse("reg.example.org/acme//schemas:v1").is_err());
        assert!(ArtifactRef::parse("reg.example.org/acme-/schemas:v1").is_err());
        assert!(ArtifactRef::parse("reg.example.org/-acme/schemas:v1").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        assert!(ArtifactRef::parse("reg.example.org/acme/schemas:-v1").is_err());
        assert!(ArtifactRef::parse("reg.example.org/acme/schemas:v 1").is_err());
        let long = "a".repeat(129);
        assert!(ArtifactRef::parse(&format!("reg.example.org/acme/schemas:{long}")).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        assert!(ArtifactRef::parse("reg.example.org/acme/schemas@sha256:short").is_err());
        assert!(ArtifactRef::parse("reg.example.org/acme/schemas@md5:abcd").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in [
            "oras.birb.homes/buck2-protobuf/tools/buf:1.47.2-darwin-arm64",
            "localhost:5000/test/hello-world:latest",
        ] {
            assert_eq!(ArtifactRef::parse(s).unwrap().to_string(), s);
        }
        let s = format!("reg.example.org/acme/schemas@{DIGEST}");
        assert_eq!(ArtifactRef::parse(&s).unwrap().to_string(), s);
    }

    #[test]
    fn test_with_digest_pins_tag() {
        let r = ArtifactRef::parse("reg.example.org/acme/schemas:v1.2.0").unwrap();
        let pinned = r.with_digest(Digest::parse(DIGEST).unwrap());
        assert_eq!(pinned.digest().map(Digest::as_str), Some(DIGEST));
        assert_eq!(pinned.repository(), r.repository());
    }

    #[test]
    fn test_safe_filename() {
        let r = ArtifactRef::parse("reg.example.org/acme/schemas:v1.2.0").unwrap();
        assert_eq!(r.safe_filename(), "reg.example.org_acme_schemas_v1.2.0");
        let r = ArtifactRef::parse("localhost:5000/test/hello-world:latest").unwrap();
        assert_eq!(r.safe_filename(), "localhost_5000_test_hello-world_latest");
    }

    #[test]
    fn test_tagged_constructor() {
        let r = ArtifactRef::tagged("oras.birb.homes", "buck2-protobuf/tools/protoc", "31.1")
            .unwrap();
        assert_eq!(r.tag(), Some("31.1"));
    }

    #[test]
    fn test_serde_round_trip() {
        let r = ArtifactRef::parse("reg.example.org/acme/schemas:v1.2.0").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        let back: ArtifactRef = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }

    mod grammar {
        use super::*;
        use proptest::prelude::*;

        fn segment() -> impl Strategy<Value = String> {
            "[a-z0-9]{1,8}([-._][a-z0-9]{1,8}){0,2}"
        }

        fn tag() -> impl Strategy<Value = String> {
            "[A-Za-z0-9_][A-Za-z0-9._-]{0,40}"
        }

        proptest! {
            #[test]
            fn valid_tagged_refs_round_trip(
                host in "[a-z][a-z0-9.-]{0,20}",
                segments in proptest::collection::vec(segment(), 1..4),
                tag in tag(),
            ) {
                let s = format!("{host}/{}:{tag}", segments.join("/"));
                let parsed = ArtifactRef::parse(&s).unwrap();
                prop_assert_eq!(parsed.to_string(), s);
                prop_assert_eq!(parsed.tag(), Some(tag.as_str()));
            }

            #[test]
            fn parse_never_panics(s in "\\PC{0,64}") {
                let _ = ArtifactRef::parse(&s);
            }

            #[test]
            fn safe_filename_charset(
                host in "[a-z][a-z0-9.-]{0,20}",
                segments in proptest::collection::vec(segment(), 1..4),
                tag in tag(),
            ) {
                let s = format!("{host}/{}:{tag}", segments.join("/"));
                let parsed = ArtifactRef::parse(&s).unwrap();
                let is_safe_char = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-';
                let all_safe = parsed.safe_filename().chars().all(is_safe_char);
                prop_assert!(all_safe);
            }
        }
    }
}
