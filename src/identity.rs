//! Peer identity management.
//!
//! This module handles:
//! - Ed25519 signing keypair generation and persistence
//! - Loading a secret key supplied through the environment
//! - Fingerprint generation for visual verification
//!
//! The public key (base64) is the durable identifier a peer presents to the
//! relay. The relay never generates or stores keys; it only compares the
//! presented key against its allow-list.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Environment variable carrying a base64 secret key that overrides the identity file.
pub const PRIVATE_KEY_ENV: &str = "GEOTRIGGER_PRIVATE_KEY";

/// On-disk identity record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    /// Base64 Ed25519 public key.
    public_key: String,
    /// Base64 32-byte Ed25519 seed.
    secret_key: String,
    /// Human-readable fingerprint.
    fingerprint: String,
}

/// Runtime identity with parsed keys.
pub struct Identity {
    /// Ed25519 signing key.
    pub signing_key: SigningKey,
    /// Ed25519 verifying key (public part of signing key).
    pub verifying_key: VerifyingKey,
    /// Human-readable fingerprint for verification.
    pub fingerprint: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Build an identity from an existing signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let fingerprint = compute_fingerprint(&verifying_key);
        Self {
            signing_key,
            verifying_key,
            fingerprint,
        }
    }

    /// Generate a fresh, unpersisted identity.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::from_signing_key(SigningKey::from_bytes(&secret))
    }

    /// Resolve the identity for a process.
    ///
    /// [`PRIVATE_KEY_ENV`] wins when set; otherwise the identity file at
    /// `path` is loaded, or created if it does not exist yet.
    pub fn resolve(path: &Path) -> Result<Self> {
        if let Ok(secret_b64) = std::env::var(PRIVATE_KEY_ENV) {
            let identity = Self::from_secret_base64(&secret_b64)
                .with_context(|| format!("Invalid {PRIVATE_KEY_ENV}"))?;
            log::info!(
                "Using identity from {}: fingerprint={}",
                PRIVATE_KEY_ENV,
                identity.fingerprint
            );
            return Ok(identity);
        }
        Self::load_or_create(path)
    }

    /// Load the identity stored at `path`, creating a new one if absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Self::create_new(path)
        }
    }

    /// Parse a base64 secret key.
    ///
    /// Accepts either a 32-byte seed or a 64-byte `seed || public` secret
    /// key as produced by NaCl-style libraries. In the 64-byte form the
    /// public half must match the seed.
    pub fn from_secret_base64(secret_b64: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(secret_b64.trim())
            .context("Invalid secret key encoding")?;

        let signing_key = match bytes.len() {
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                SigningKey::from_bytes(&seed)
            }
            64 => {
                let mut keypair = [0u8; 64];
                keypair.copy_from_slice(&bytes);
                SigningKey::from_keypair_bytes(&keypair)
                    .context("Secret key does not match its embedded public key")?
            }
            other => anyhow::bail!("Invalid secret key length: {other} bytes"),
        };

        Ok(Self::from_signing_key(signing_key))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity file {}", path.display()))?;
        let stored: StoredIdentity =
            serde_json::from_str(&content).context("Failed to parse identity file")?;

        let identity = Self::from_secret_base64(&stored.secret_key)?;

        if identity.public_key_base64() != stored.public_key {
            anyhow::bail!(
                "Identity file {} is inconsistent: stored public key does not match secret key",
                path.display()
            );
        }
        if identity.fingerprint != stored.fingerprint {
            log::warn!(
                "Identity fingerprint stale (was {}, derived {})",
                stored.fingerprint,
                identity.fingerprint
            );
        }

        log::info!("Loaded identity: fingerprint={}", identity.fingerprint);
        Ok(identity)
    }

    fn create_new(path: &Path) -> Result<Self> {
        let identity = Self::generate();
        identity.save(path)?;
        log::info!(
            "Created new identity at {}: fingerprint={}",
            path.display(),
            identity.fingerprint
        );
        Ok(identity)
    }

    /// Persist the identity to `path` with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create identity directory")?;
        }

        let stored = StoredIdentity {
            public_key: self.public_key_base64(),
            secret_key: BASE64.encode(self.signing_key.to_bytes()),
            fingerprint: self.fingerprint.clone(),
        };
        let content =
            serde_json::to_string_pretty(&stored).context("Failed to serialize identity")?;

        fs::write(path, content).context("Failed to write identity file")?;

        #[cfg(unix)]
        {
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set identity file permissions")?;
        }

        Ok(())
    }

    /// Public key as base64, the form used on the wire and in allow-lists.
    pub fn public_key_base64(&self) -> String {
        crate::signature::encode_public_key(&self.verifying_key)
    }

    /// Default identity file for a role, e.g. `{config_dir}/agent-identity.json`.
    pub fn default_path(role: &str) -> Result<PathBuf> {
        Ok(crate::config::config_dir()?.join(format!("{role}-identity.json")))
    }
}

/// Compute fingerprint from a verifying key.
///
/// The fingerprint is the first 8 bytes of SHA256(verifying_key) as hex.
pub fn compute_fingerprint(verifying_key: &VerifyingKey) -> String {
    let hash = Sha256::digest(verifying_key.as_bytes());
    hash[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
