//! Reasons the relay terminates a connection.

use thiserror::Error;

use crate::constants::{CLOSE_POLICY_VIOLATION, CLOSE_PROCESSING_ERROR};

/// Terminal failure for a single relay connection.
///
/// The `Display` text doubles as the close reason sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The presented public key is not on the allow-list.
    #[error("Unauthorized client")]
    UnauthorizedIdentity,
    /// A registration or payload signature did not verify.
    #[error("Invalid signature")]
    InvalidSignature,
    /// A frame that is not allowed in the connection's current state.
    #[error("{0}")]
    ProtocolViolation(String),
    /// The frame could not be decoded as a JSON object.
    #[error("Malformed frame")]
    MalformedFrame,
    /// No valid `register` frame arrived before the deadline.
    #[error("Registration timeout")]
    RegistrationTimeout,
    /// An authenticated peer went silent for longer than the liveness window.
    #[error("Liveness timeout")]
    LivenessTimeout,
}

impl RelayError {
    /// Shorthand for [`RelayError::ProtocolViolation`].
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    /// Close code sent to the peer, or `None` when the transport is dropped
    /// without a closing handshake.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::UnauthorizedIdentity
            | Self::InvalidSignature
            | Self::ProtocolViolation(_)
            | Self::RegistrationTimeout => Some(CLOSE_POLICY_VIOLATION),
            Self::MalformedFrame => Some(CLOSE_PROCESSING_ERROR),
            Self::LivenessTimeout => None,
        }
    }
}
