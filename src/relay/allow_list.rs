//! Static set of identities allowed to register with the relay.

use std::collections::HashMap;
use std::fmt;

use ed25519_dalek::VerifyingKey;

use super::error::RelayError;
use crate::config::RelayConfig;
use crate::protocol::RegisterMessage;
use crate::signature::{self, SignatureError};

/// What an allow-listed identity is expected to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Sends location updates.
    Publisher,
    /// Consumes location updates and runs actions.
    Agent,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Agent => f.write_str("agent"),
        }
    }
}

/// Identity bound to a connection after a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPeer {
    /// Role configured for this key.
    pub role: PeerRole,
    /// Base64 public key, as configured.
    pub public_key: String,
    /// Decoded key, used for optional payload verification.
    pub verifying_key: VerifyingKey,
}

/// Allow-list keyed by the canonical base64 form of each public key.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: HashMap<String, (PeerRole, VerifyingKey)>,
}

impl AllowList {
    /// Build from the relay configuration.
    pub fn from_config(config: &RelayConfig) -> Result<Self, SignatureError> {
        let mut list = Self::default();
        list.insert(PeerRole::Publisher, &config.publisher_key)?;
        for key in &config.agent_keys {
            list.insert(PeerRole::Agent, key)?;
        }
        Ok(list)
    }

    /// Add `public_key_b64` under `role`.
    pub fn insert(&mut self, role: PeerRole, public_key_b64: &str) -> Result<(), SignatureError> {
        let key = signature::decode_public_key(public_key_b64)?;
        self.entries
            .insert(signature::encode_public_key(&key), (role, key));
        Ok(())
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no key is allowed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check a registration envelope.
    ///
    /// The key must be listed and the signature must verify against it.
    pub fn authenticate(&self, message: &RegisterMessage) -> Result<AuthenticatedPeer, RelayError> {
        let Ok(presented) = signature::decode_public_key(&message.public_key) else {
            return Err(RelayError::UnauthorizedIdentity);
        };
        let canonical = signature::encode_public_key(&presented);

        let Some((role, verifying_key)) = self.entries.get(&canonical) else {
            return Err(RelayError::UnauthorizedIdentity);
        };

        if !message.verify(verifying_key) {
            return Err(RelayError::InvalidSignature);
        }

        Ok(AuthenticatedPeer {
            role: *role,
            public_key: canonical,
            verifying_key: *verifying_key,
        })
    }
}
