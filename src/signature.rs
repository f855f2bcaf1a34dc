//! Ed25519 signing and verification over exact byte sequences.
//!
//! The verifier must be handed the same bytes the signer produced. Any
//! decoding problem (bad base64, wrong key length, malformed signature)
//! makes verification return `false` rather than an error, so callers
//! can treat "could not check" and "checked and failed" the same way.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Errors raised while decoding keys or signatures from their wire form.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// Input was not valid standard base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Decoded bytes had the wrong length for the expected type.
    #[error("expected {expected} bytes, got {actual}")]
    Length {
        /// Required length.
        expected: usize,
        /// Length actually decoded.
        actual: usize,
    },
    /// Bytes did not form a valid Ed25519 public key.
    #[error("invalid public key: {0}")]
    Key(#[from] ed25519_dalek::SignatureError),
}

/// Sign `message` with `signing_key`.
pub fn sign(message: &[u8], signing_key: &SigningKey) -> Signature {
    signing_key.sign(message)
}

/// Verify `signature` over `message` against `verifying_key`.
pub fn verify(message: &[u8], signature: &Signature, verifying_key: &VerifyingKey) -> bool {
    verifying_key.verify(message, signature).is_ok()
}

/// Sign `message` and return the signature as base64.
pub fn sign_base64(message: &[u8], signing_key: &SigningKey) -> String {
    BASE64.encode(sign(message, signing_key).to_bytes())
}

/// Verify a base64 signature. Returns `false` if the signature cannot be decoded.
pub fn verify_base64(message: &[u8], signature_b64: &str, verifying_key: &VerifyingKey) -> bool {
    match decode_signature(signature_b64) {
        Ok(signature) => verify(message, &signature, verifying_key),
        Err(e) => {
            log::debug!("Rejecting undecodable signature: {e}");
            false
        }
    }
}

/// Decode a base64 Ed25519 public key.
pub fn decode_public_key(public_key_b64: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = BASE64.decode(public_key_b64.trim())?;
    let key_bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_len| SignatureError::Length {
            expected: 32,
            actual: bytes.len(),
        })?;
    Ok(VerifyingKey::from_bytes(&key_bytes)?)
}

/// Encode a public key as base64.
pub fn encode_public_key(verifying_key: &VerifyingKey) -> String {
    BASE64.encode(verifying_key.as_bytes())
}

fn decode_signature(signature_b64: &str) -> Result<Signature, SignatureError> {
    let bytes = BASE64.decode(signature_b64)?;
    let sig_bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_len| SignatureError::Length {
            expected: 64,
            actual: bytes.len(),
        })?;
    Ok(Signature::from_bytes(&sig_bytes))
}
