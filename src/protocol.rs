//! Wire protocol shared by the relay and its peers.
//!
//! Frames are WebSocket text messages carrying a JSON object with a `type`
//! discriminator:
//!
//! ```text
//! {"type":"register","publicKey":"<base64>","signature":"<base64>"}
//! {"type":"heartbeat"}
//! {"type":"location","latitude":51.5,"longitude":-0.12,"timestamp":"<ISO-8601>"}
//! ```
//!
//! # Signatures
//!
//! The registration signature covers exactly `{"type":"register","publicKey":"..."}`
//! with those two keys in that order, which is what [`registration_payload`]
//! produces. Optional payload signatures on other frames cover
//! [`canonical_payload`]: the object without its `signature` field,
//! re-serialized with sorted keys.

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signature;

/// `type` value of a registration frame.
pub const TYPE_REGISTER: &str = "register";
/// `type` value of a heartbeat frame.
pub const TYPE_HEARTBEAT: &str = "heartbeat";
/// `type` value of a location frame.
pub const TYPE_LOCATION: &str = "location";

/// Name of the optional signature field on signed frames.
pub const SIGNATURE_FIELD: &str = "signature";

/// Registration envelope sent as the first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage {
    /// Base64 Ed25519 public key of the sender.
    pub public_key: String,
    /// Base64 signature over [`registration_payload`] of `public_key`.
    pub signature: String,
}

impl RegisterMessage {
    /// Build a registration envelope signed with `signing_key`.
    pub fn signed(signing_key: &SigningKey) -> Self {
        let public_key = signature::encode_public_key(&signing_key.verifying_key());
        let payload = registration_payload(&public_key);
        Self {
            signature: signature::sign_base64(&payload, signing_key),
            public_key,
        }
    }

    /// Check the envelope's signature against `verifying_key`.
    pub fn verify(&self, verifying_key: &VerifyingKey) -> bool {
        signature::verify_base64(
            &registration_payload(&self.public_key),
            &self.signature,
            verifying_key,
        )
    }

    /// Serialize as a complete frame.
    pub fn to_frame(&self) -> String {
        serde_json::json!({
            "type": TYPE_REGISTER,
            "publicKey": self.public_key,
            "signature": self.signature,
        })
        .to_string()
    }
}

/// The exact bytes a registration signature covers.
pub fn registration_payload(public_key: &str) -> Vec<u8> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload<'a> {
        #[serde(rename = "type")]
        kind: &'static str,
        public_key: &'a str,
    }

    // Struct serialization keeps declaration order, unlike a `Value` map.
    serde_json::to_vec(&Payload {
        kind: TYPE_REGISTER,
        public_key,
    })
    .unwrap_or_default()
}

/// A single location sample from the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// When the sample was taken, on the publisher's clock.
    pub timestamp: DateTime<Utc>,
}

impl LocationUpdate {
    /// Sample taken now.
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp: Utc::now(),
        }
    }

    /// Frame as a JSON object, optionally carrying a payload signature.
    pub fn to_frame(&self, signing_key: Option<&SigningKey>) -> String {
        let mut frame = serde_json::json!({
            "type": TYPE_LOCATION,
            "latitude": self.latitude,
            "longitude": self.longitude,
            "timestamp": self.timestamp,
        });
        if let Some(key) = signing_key {
            let sig = signature::sign_base64(&canonical_payload(&frame), key);
            frame[SIGNATURE_FIELD] = Value::String(sig);
        }
        frame.to_string()
    }
}

/// Heartbeat frame text.
pub fn heartbeat_frame() -> String {
    serde_json::json!({ "type": TYPE_HEARTBEAT }).to_string()
}

/// Value of the `type` field, if present and a string.
pub fn frame_type(frame: &Value) -> Option<&str> {
    frame.get("type").and_then(Value::as_str)
}

/// Bytes covered by a payload signature: the frame without its `signature`
/// field, serialized with sorted keys.
pub fn canonical_payload(frame: &Value) -> Vec<u8> {
    let mut unsigned = frame.clone();
    if let Value::Object(map) = &mut unsigned {
        map.remove(SIGNATURE_FIELD);
    }
    serde_json::to_vec(&unsigned).unwrap_or_default()
}

/// Verify the payload signature carried by `frame`.
///
/// Returns `false` when the frame carries no signature.
pub fn verify_payload(frame: &Value, verifying_key: &VerifyingKey) -> bool {
    let Some(sig) = frame.get(SIGNATURE_FIELD).and_then(Value::as_str) else {
        return false;
    };
    signature::verify_base64(&canonical_payload(frame), sig, verifying_key)
}
