//! Core types and error handling for the protodist ecosystem.
//!
//! This crate carries the vocabulary shared by every other protodist crate:
//! content digests, artifact references, platform identification, the cache
//! directory layout, and the closed error taxonomy that drives strategy
//! fallback in the resolver.

pub mod digest;
pub mod error;
pub mod paths;
pub mod platform;
pub mod reference;

pub use digest::Digest;
pub use error::{Error, ErrorKind, Result};
pub use paths::CacheLayout;
pub use platform::{Arch, Os, Platform};
pub use reference::{ArtifactRef, RefTarget};

/// Process exit codes shared by every process-shaped entry point.
pub mod exit {
    /// Operation completed.
    pub const SUCCESS: i32 = 0;
    /// Unrecoverable error.
    pub const FAILURE: i32 = 1;
    /// Argument or configuration error.
    pub const USAGE: i32 = 2;
    /// A bounded operation timed out.
    pub const TIMEOUT: i32 = 124;
}
