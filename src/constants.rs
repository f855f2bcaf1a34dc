//! Protocol-wide constants for geotrigger.
//!
//! Timing defaults live here so the relay and its clients agree on them.
//! Every duration can be overridden through configuration; these values
//! are what a deployment gets when it does not.
//!
//! # Categories
//!
//! - **Relay**: registration deadline and liveness enforcement
//! - **Client**: heartbeat cadence and reconnect delay
//! - **Close codes**: WebSocket close codes used by the relay

use std::time::Duration;

// ============================================================================
// Relay
// ============================================================================

/// Time a freshly accepted connection has to send a valid `register` frame.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum silence tolerated from an authenticated connection.
///
/// Must comfortably exceed [`HEARTBEAT_INTERVAL`] so a single delayed
/// heartbeat does not drop a healthy peer.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(45);

/// Interval of the coarse liveness sweep.
///
/// Each pass pings every connection and terminates those silent for longer
/// than both this interval and [`LIVENESS_WINDOW`], independently of their
/// own liveness timers.
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default listen address for the relay.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

// ============================================================================
// Client
// ============================================================================

/// Cadence of outbound `heartbeat` frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed delay before reconnecting to the relay. No backoff, no jitter.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Close codes
// ============================================================================

/// Policy violation (RFC 6455 §7.4.1): unauthorized key, bad signature,
/// registration timeout, or a frame that is not allowed in the current state.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Processing error: the frame could not be decoded at all.
pub const CLOSE_PROCESSING_ERROR: u16 = 1011;
