//! Content digests.
//!
//! A digest is the canonical identity of a blob: `sha256:` followed by 64
//! lowercase hex characters. Equality is byte-exact on the lowercase form.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::{Error, Result};

/// Hash buffer size for streamed digest computation.
const HASH_CHUNK: usize = 8192;

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// The only supported digest algorithm.
    pub const ALGORITHM: &'static str = "sha256";

    /// Parse and validate a digest string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the algorithm is not `sha256` or
    /// the hex part is not exactly 64 lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        let Some((algo, hex)) = s.split_once(':') else {
            return Err(Error::config_invalid(format!(
                "Digest '{s}' is missing the algorithm prefix"
            )));
        };
        if algo != Self::ALGORITHM {
            return Err(Error::config_invalid(format!(
                "Unsupported digest algorithm '{algo}', only sha256 is supported"
            )));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(Error::config_invalid(format!(
                "Digest hex '{hex}' must be 64 lowercase hex characters"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Compute the digest of an in-memory byte slice.
    #[must_use]
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        let hash = Sha256::digest(data.as_ref());
        Self(format!("{}:{}", Self::ALGORITHM, hex::encode(hash)))
    }

    /// Compute the digest of a reader, streaming in 8 KiB chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; HASH_CHUNK];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(Self(format!(
            "{}:{}",
            Self::ALGORITHM,
            hex::encode(hasher.finalize())
        )))
    }

    /// Compute the digest of a file on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// The full `sha256:<hex>` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 64-character hex part.
    #[must_use]
    pub fn hex(&self) -> &str {
        // Constructors guarantee the colon is present.
        self.0.split_once(':').map_or(self.0.as_str(), |(_, h)| h)
    }

    /// The two-character fan-out prefix used for on-disk sharding.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.hex()[..2]
    }

    /// Shortened form for log lines: algorithm plus first 12 hex chars.
    #[must_use]
    pub fn short(&self) -> String {
        format!("{}:{}", Self::ALGORITHM, &self.hex()[..12])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
