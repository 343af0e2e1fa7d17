//! Symmetric encryption for the on-disk credential blob.
//!
//! The key is 32 random bytes stored next to the blob at mode 0600. The
//! contract is "not readable by other local users", not "secure against
//! root": when no OS keychain is available this file-based key is the
//! graceful degradation.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::fs;
use std::path::Path;

use protodist_core::{Error, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Load the key material, generating and persisting it on first use.
///
/// # Errors
///
/// Returns an error if the key file cannot be read or written.
pub fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    if path.is_file() {
        let data = fs::read(path)?;
        let key: [u8; KEY_LEN] = data
            .try_into()
            .map_err(|_| Error::config_invalid("credential key file has wrong length"))?;
        return Ok(key);
    }
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, key)?;
    restrict_mode(path)?;
    Ok(key)
}

/// Encrypt a plaintext blob. Output is `nonce || ciphertext`.
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::internal("credential encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// # Errors
///
/// Returns an error if the blob is malformed or authentication fails.
pub fn decrypt(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(Error::internal("credential blob is truncated"));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::internal("credential blob failed authentication"))
}

/// Set mode 0600 on a secret-bearing file.
///
/// # Errors
///
/// Returns an error if permissions cannot be changed.
pub fn restrict_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Whether a secret-bearing file has exactly mode 0600.
#[must_use]
pub fn has_restricted_mode(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o777 == 0o600)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
