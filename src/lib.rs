//! Geotrigger - location-driven automation over an authenticated relay.
//!
//! A location publisher and one or more automation agents connect to a
//! relay hub over WebSocket. Every peer proves control of an allow-listed
//! Ed25519 key when it connects; after that the relay fans location frames
//! out to the other peers. Agents evaluate geofence rules against the latest
//! location on a per-rule cadence and launch external actions when a rule
//! fires.
//!
//! # Architecture
//!
//! ```text
//!   publisher ──ws──► relay hub ──ws──► agent
//!                                        ├── channel: reconnect + heartbeat
//!                                        ├── location: latest-value feed
//!                                        ├── geofence: one loop per rule
//!                                        └── action: child processes
//! ```
//!
//! # Modules
//!
//! - [`relay`] - Relay hub: registration, liveness, fan-out
//! - [`channel`] - Agent-side relay client
//! - [`geofence`] - Rules, decisions and the scheduler
//! - [`action`] - Fire-and-forget action launching
//! - [`daemon`] - Agent composition root
//! - [`publisher`] - One-shot location publisher
//! - [`config`] - Configuration loading

pub mod action;
pub mod channel;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod geo;
pub mod geofence;
pub mod identity;
pub mod location;
pub mod protocol;
pub mod publisher;
pub mod relay;
pub mod signature;
pub mod ws;

pub use config::{AgentConfig, RelayConfig};
pub use identity::Identity;
pub use protocol::LocationUpdate;
