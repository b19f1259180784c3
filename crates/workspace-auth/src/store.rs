//! Encrypted token storage
//!
//! Persists the single `TokenSet` as a JSON envelope holding base64 salt,
//! nonce and AES-256-GCM ciphertext. The key is derived from the configured
//! key material with PBKDF2-HMAC-SHA256 and a fresh random salt on every
//! write. Writes use atomic temp-file + rename with 0600 permissions.
//!
//! The file is last-writer-wins: concurrent writers are not serialized by a
//! file lock. Acceptable for a single-user local tool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::token::TokenSet;

/// Envelope format version written to disk.
const ENVELOPE_VERSION: u32 = 1;

/// PBKDF2 rounds for key derivation.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// On-disk representation. Only ciphertext; never plaintext token values.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Encrypted file-backed store for one token set.
pub struct TokenStore {
    path: PathBuf,
    key_material: Secret<String>,
    iterations: u32,
}

impl TokenStore {
    pub fn new(path: PathBuf, key_material: Secret<String>) -> Self {
        Self {
            path,
            key_material,
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    /// Override the PBKDF2 round count (tests use a low value).
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encrypt and persist `tokens`, replacing any existing file.
    pub async fn store(&self, tokens: &TokenSet) -> Result<()> {
        let plaintext = serde_json::to_vec(tokens)
            .map_err(|e| Error::Storage(format!("serializing tokens: {e}")))?;
        let envelope = self.seal(plaintext).await?;
        let json = serde_json::to_string_pretty(&envelope)
            .map_err(|e| Error::Storage(format!("serializing token envelope: {e}")))?;
        write_atomic(&self.path, json.as_bytes()).await?;
        info!(path = %self.path.display(), scopes = tokens.scopes.len(), "stored tokens");
        Ok(())
    }

    /// Load and decrypt the stored tokens.
    ///
    /// Returns `None` if the file is absent. A file that cannot be parsed or
    /// decrypted (wrong key, tampering, truncation) is reported and treated as
    /// absent so the next acquisition starts a fresh authorization.
    pub async fn retrieve(&self) -> Result<Option<TokenSet>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no token file");
                return Ok(None);
            }
            Err(e) => return Err(Error::Storage(format!("reading token file: {e}"))),
        };

        let envelope: Envelope = match serde_json::from_slice(&contents) {
            Ok(env) => env,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "token file is not a valid envelope, ignoring");
                return Ok(None);
            }
        };
        if envelope.version != ENVELOPE_VERSION {
            warn!(version = envelope.version, "unsupported token file version, ignoring");
            return Ok(None);
        }

        let plaintext = match self.open(envelope).await {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "token file could not be decrypted, ignoring");
                return Ok(None);
            }
        };

        match serde_json::from_slice::<TokenSet>(&plaintext) {
            Ok(tokens) => {
                debug!(path = %self.path.display(), "loaded tokens");
                Ok(Some(tokens))
            }
            Err(e) => {
                warn!(error = %e, "decrypted token payload is malformed, ignoring");
                Ok(None)
            }
        }
    }

    /// Delete the token file. Absent file is not an error.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "cleared stored tokens");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("removing token file: {e}"))),
        }
    }

    /// True when `tokens` expire within `buffer` of now.
    pub fn is_expired(tokens: &TokenSet, buffer: Duration) -> bool {
        !tokens.is_valid(buffer)
    }

    async fn seal(&self, plaintext: Vec<u8>) -> Result<Envelope> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut salt);
        rand::rng().fill(&mut nonce);

        let key = self.derive_key(salt).await?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Storage(format!("cipher key: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| Error::Storage(format!("encrypting tokens: {e}")))?;

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    async fn open(&self, envelope: Envelope) -> Result<Vec<u8>> {
        let salt: [u8; SALT_LEN] = decode_fixed(&envelope.salt, "salt")?;
        let nonce: [u8; NONCE_LEN] = decode_fixed(&envelope.nonce, "nonce")?;
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|e| Error::Storage(format!("decoding ciphertext: {e}")))?;

        let key = self.derive_key(salt).await?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Storage(format!("cipher key: {e}")))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| Error::Storage("authentication tag mismatch".into()))
    }

    /// PBKDF2 is CPU-bound; run it off the async workers.
    async fn derive_key(&self, salt: [u8; SALT_LEN]) -> Result<[u8; KEY_LEN]> {
        let material = self.key_material.clone();
        let iterations = self.iterations;
        tokio::task::spawn_blocking(move || {
            let mut key = [0u8; KEY_LEN];
            pbkdf2::pbkdf2_hmac::<Sha256>(
                material.expose().as_bytes(),
                &salt,
                iterations,
                &mut key,
            );
            key
        })
        .await
        .map_err(|e| Error::Storage(format!("key derivation task failed: {e}")))
    }
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Storage(format!("decoding {what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("{what} must be {N} bytes")))
}

/// Write the token file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target, so a crash mid-write never leaves a truncated file. The
/// temporary file is restricted to 0600 before the rename.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("token path has no parent directory".into()))?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Storage(format!("creating token directory: {e}")))?;

    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Storage(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token file");
    Ok(())
}
