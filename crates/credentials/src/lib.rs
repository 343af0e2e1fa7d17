//! Per-registry credential acquisition and storage.
//!
//! The store answers "what credential should I use for this registry?" by
//! trying acquisition sources in a fixed order:
//!
//! 1. environment variables (`BSR_TOKEN` for the BSR family,
//!    `ORAS_USERNAME`/`ORAS_PASSWORD` otherwise)
//! 2. the user's netrc file, indexed by host
//! 3. a service-account JSON file named by `PROTODIST_SERVICE_ACCOUNT_FILE`
//! 4. an interactive prompt (only on a TTY, only when explicitly enabled)
//! 5. the encrypted local store
//!
//! Whatever a source yields is written back to the encrypted store so later
//! lookups are cheap. Tokens never appear in logs; only the masked
//! `abcd...wxyz` form does.

pub mod crypto;
pub mod netrc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use protodist_core::paths::SERVICE_ACCOUNT_ENV;
use protodist_core::{CacheLayout, Error, Result};

/// Environment variable holding a BSR token.
pub const BSR_TOKEN_ENV: &str = "BSR_TOKEN";
/// Environment variable holding a registry username.
pub const ORAS_USERNAME_ENV: &str = "ORAS_USERNAME";
/// Environment variable holding a registry password or token.
pub const ORAS_PASSWORD_ENV: &str = "ORAS_PASSWORD";

const STORE_FILE: &str = "store.enc";
const KEY_FILE: &str = "store.key";
const MIN_TOKEN_LEN: usize = 8;

/// How a credential was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// From an environment variable.
    Environment,
    /// From the user's netrc file.
    Netrc,
    /// From a service-account file.
    ServiceAccount,
    /// Typed in at a prompt.
    Interactive,
    /// Read back from the encrypted store.
    Stored,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Environment => "environment",
            Self::Netrc => "netrc",
            Self::ServiceAccount => "service_account",
            Self::Interactive => "interactive",
            Self::Stored => "stored",
        };
        f.write_str(s)
    }
}

/// A credential for one registry.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// The opaque secret. Never logged raw.
    pub token: String,
    /// Username, for registries using basic auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// The registry host this credential is scoped to.
    pub registry: String,
    /// How the credential was acquired.
    pub auth_method: AuthMethod,
    /// When the credential was acquired.
    pub created_at: DateTime<Utc>,
    /// Expiry, if the issuer provided one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Create a validated credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the token is empty, too short, or
    /// contains whitespace or non-printable characters.
    pub fn new(
        token: impl Into<String>,
        registry: impl Into<String>,
        auth_method: AuthMethod,
    ) -> Result<Self> {
        let token = token.into();
        validate_token(&token)?;
        Ok(Self {
            token,
            username: None,
            registry: registry.into(),
            auth_method,
            created_at: Utc::now(),
            expires_at: None,
        })
    }

    /// Attach a username.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Attach an expiry.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the credential is past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at < Utc::now())
    }

    /// Masked form for log lines: first four and last four characters.
    #[must_use]
    pub fn masked(&self) -> String {
        mask_token(&self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.masked())
            .field("username", &self.username)
            .field("registry", &self.registry)
            .field("auth_method", &self.auth_method)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::config_invalid("credential token is empty"));
    }
    if token.len() < MIN_TOKEN_LEN {
        return Err(Error::config_invalid(format!(
            "credential token is too short ({} < {MIN_TOKEN_LEN} characters)",
            token.len()
        )));
    }
    if !token.chars().all(|c| c.is_ascii_graphic()) {
        return Err(Error::config_invalid(
            "credential token contains whitespace or non-printable characters",
        ));
    }
    Ok(())
}

fn mask_token(token: &str) -> String {
    if token.len() <= MIN_TOKEN_LEN {
        return "****".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

/// Shape of a service-account credential file.
#[derive(Debug, Deserialize)]
struct ServiceAccountFile {
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    registry: Option<String>,
}

/// Per-registry credential store with the acquisition ladder of the module
/// docs.
///
/// Single-writer per process; the blob file is only ever replaced atomically,
/// so concurrent readers are safe.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
    netrc_path: Option<PathBuf>,
    interactive: bool,
}

impl CredentialStore {
    /// Create a store under the given cache layout.
    #[must_use]
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            dir: layout.credentials_dir(),
            netrc_path: netrc::default_path(),
            interactive: false,
        }
    }

    /// Create a store rooted at an explicit directory.
    #[must_use]
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            netrc_path: netrc::default_path(),
            interactive: false,
        }
    }

    /// Enable the interactive prompt source. Off by default; even when on it
    /// only fires with a TTY attached.
    #[must_use]
    pub fn with_interactive(mut self, enabled: bool) -> Self {
        self.interactive = enabled;
        self
    }

    /// Override the netrc file location.
    #[must_use]
    pub fn with_netrc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.netrc_path = Some(path.into());
        self
    }

    /// Find a credential for a registry, walking the acquisition ladder.
    ///
    /// Expired stored entries are deleted before this returns. A credential
    /// acquired from any source is persisted to the encrypted store.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failures; "no credential anywhere"
    /// is `Ok(None)`.
    pub fn lookup(&self, registry: &str) -> Result<Option<Credential>> {
        for source in [
            Self::from_env,
            Self::from_netrc,
            Self::from_service_account,
            Self::from_prompt,
        ] {
            if let Some(credential) = source(self, registry)? {
                debug!(
                    registry,
                    method = %credential.auth_method,
                    token = %credential.masked(),
                    "Acquired credential"
                );
                self.store(&credential)?;
                return Ok(Some(credential));
            }
        }
        self.from_stored(registry)
    }

    /// Persist a credential to the encrypted store.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or the file write fails.
    pub fn store(&self, credential: &Credential) -> Result<()> {
        let mut stored = self.load_stored()?;
        stored.insert(credential.registry.clone(), credential.clone());
        self.save_stored(&stored)
    }

    /// Remove the stored credential for a registry. Returns whether one
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be rewritten.
    pub fn logout(&self, registry: &str) -> Result<bool> {
        let mut stored = self.load_stored()?;
        let existed = stored.remove(registry).is_some();
        if existed {
            self.save_stored(&stored)?;
        }
        Ok(existed)
    }

    fn from_env(&self, registry: &str) -> Result<Option<Credential>> {
        if is_bsr_family(registry) {
            if let Ok(token) = std::env::var(BSR_TOKEN_ENV) {
                if !token.is_empty() {
                    return Credential::new(token, registry, AuthMethod::Environment).map(Some);
                }
            }
            return Ok(None);
        }
        if let Ok(password) = std::env::var(ORAS_PASSWORD_ENV) {
            if !password.is_empty() {
                let mut credential =
                    Credential::new(password, registry, AuthMethod::Environment)?;
                if let Ok(username) = std::env::var(ORAS_USERNAME_ENV) {
                    if !username.is_empty() {
                        credential = credential.with_username(username);
                    }
                }
                return Ok(Some(credential));
            }
        }
        Ok(None)
    }

    fn from_netrc(&self, registry: &str) -> Result<Option<Credential>> {
        let Some(path) = &self.netrc_path else {
            return Ok(None);
        };
        let entries = netrc::load(path);
        let Some(entry) = netrc::lookup(&entries, registry) else {
            return Ok(None);
        };
        let Some(password) = &entry.password else {
            return Ok(None);
        };
        let mut credential = Credential::new(password.clone(), registry, AuthMethod::Netrc)?;
        if let Some(login) = &entry.login {
            credential = credential.with_username(login.clone());
        }
        Ok(Some(credential))
    }

    fn from_service_account(&self, registry: &str) -> Result<Option<Credential>> {
        let Ok(path) = std::env::var(SERVICE_ACCOUNT_ENV) else {
            return Ok(None);
        };
        if path.is_empty() {
            return Ok(None);
        }
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(%path, error = %e, "Service-account file named but unreadable");
                return Ok(None);
            }
        };
        let file: ServiceAccountFile = serde_json::from_slice(&data)?;
        if let Some(scoped) = &file.registry {
            if scoped != registry {
                return Ok(None);
            }
        }
        let Some(token) = file.token.or(file.private_key) else {
            return Err(Error::config_invalid(
                "service-account file has neither 'token' nor 'private_key'",
            ));
        };
        let mut credential = Credential::new(token, registry, AuthMethod::ServiceAccount)?;
        if let Some(account_id) = file.account_id {
            credential = credential.with_username(account_id);
        }
        Ok(Some(credential))
    }

    fn from_prompt(&self, registry: &str) -> Result<Option<Credential>> {
        if !self.interactive || !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        eprint!("Token for {registry}: ");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        let token = line.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Credential::new(token, registry, AuthMethod::Interactive).map(Some)
    }

    fn from_stored(&self, registry: &str) -> Result<Option<Credential>> {
        let mut stored = self.load_stored()?;
        match stored.get(registry) {
            Some(credential) if credential.is_expired() => {
                // Invariant: expired entries are deleted on read.
                debug!(registry, "Deleting expired stored credential");
                stored.remove(registry);
                self.save_stored(&stored)?;
                Ok(None)
            }
            Some(credential) => {
                let mut credential = credential.clone();
                credential.auth_method = AuthMethod::Stored;
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    fn store_path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    fn load_stored(&self) -> Result<HashMap<String, Credential>> {
        let path = self.store_path();
        if !path.is_file() {
            return Ok(HashMap::new());
        }
        if !crypto::has_restricted_mode(&path) {
            // A loosened mode means another local user may have read or
            // replaced the blob; discard it and start over at 0600.
            warn!(?path, "Credential store has unsafe permissions; discarding");
            self.save_stored(&HashMap::new())?;
            return Ok(HashMap::new());
        }
        let key = crypto::load_or_create_key(&self.key_path())?;
        let blob = fs::read(&path)?;
        let plaintext = match crypto::decrypt(&key, &blob) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(?path, error = %e, "Credential store unreadable; discarding");
                self.save_stored(&HashMap::new())?;
                return Ok(HashMap::new());
            }
        };
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn save_stored(&self, stored: &HashMap<String, Credential>) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let key = crypto::load_or_create_key(&self.key_path())?;
        let blob = crypto::encrypt(&key, &serde_json::to_vec(stored)?)?;
        let path = self.store_path();
        let tmp = path.with_extension("enc.tmp");
        fs::write(&tmp, &blob)?;
        crypto::restrict_mode(&tmp)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// The directory holding the store and key files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_bsr_family(registry: &str) -> bool {
    let host = registry.split(':').next().unwrap_or(registry);
    host == "buf.build" || host.ends_with(".buf.build")
}
