//! OCI registry client for protodist.
//!
//! This crate provides:
//! - the manifest model protodist produces and consumes (one file per
//!   layer, titles carried in annotations)
//! - a distribution client that pulls into the content-addressed cache,
//!   pushes manifests and blobs, lists tags, and resolves tags to digests
//!
//! Every blob is verified against its manifest digest before the cache or a
//! caller sees it; a mismatch is fatal for the request.

pub mod client;
pub mod manifest;

pub use client::{RegistryClient, PULL_TIMEOUT, PUSH_TIMEOUT, REQUEST_TIMEOUT};
pub use manifest::{Descriptor, Manifest, annotations};
