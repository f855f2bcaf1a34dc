//! Location channel client.
//!
//! Keeps one logical connection to the relay open for the agent, registering
//! with the agent's identity on every (re)connect and heartbeating while the
//! socket is up. Accepted `location` frames replace the shared latest
//! location (see [`crate::location`]).
//!
//! # Reconnect
//!
//! Any close, transport error or failed dial schedules a reconnect after a
//! fixed delay. There is no backoff growth and no jitter; the peer count is
//! tiny. Transport loss is never fatal to the process.
//!
//! ```text
//!   dial ──► send register ──► message loop ──(lost)──► sleep(delay) ──┐
//!    ▲                             │ heartbeat every interval           │
//!    └─────────────────────────────┴────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::identity::Identity;
use crate::location::{LocationReader, LocationWriter, ReceivedLocation};
use crate::protocol::{self, LocationUpdate, RegisterMessage, TYPE_HEARTBEAT, TYPE_LOCATION};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Connection settings for [`LocationChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Relay endpoint (`ws://` or `wss://`).
    pub relay_url: String,
    /// Cadence of outbound heartbeats.
    pub heartbeat_interval: Duration,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Publisher key used when `verify_signatures` is set.
    pub publisher_key: Option<VerifyingKey>,
    /// Drop location frames whose payload signature does not verify.
    pub verify_signatures: bool,
}

impl ChannelConfig {
    /// Derive channel settings from the agent configuration.
    pub fn from_agent_config(config: &AgentConfig) -> Result<Self> {
        let publisher_key = config
            .publisher_verifying_key()
            .context("Invalid publisherKey")?;
        if config.verify_location_signatures && publisher_key.is_none() {
            anyhow::bail!("verifyLocationSignatures requires publisherKey");
        }
        Ok(Self {
            relay_url: ws::http_to_ws_scheme(&config.relay_url),
            heartbeat_interval: config.heartbeat_interval,
            reconnect_delay: config.reconnect_delay,
            publisher_key,
            verify_signatures: config.verify_location_signatures,
        })
    }
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// A location update replaced the latest location.
    Accepted,
    /// Heartbeat or unknown frame type.
    Ignored,
    /// Undecodable, or failed signature verification.
    Rejected,
}

/// Result of the inner message loop.
enum ConnectionLoopExit {
    /// Shutdown was requested.
    Shutdown,
    /// Connection was lost, reconnect.
    Disconnected,
}

/// Handle to the background channel task.
#[derive(Debug)]
pub struct LocationChannel {
    connected: Arc<AtomicBool>,
    location: LocationReader,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LocationChannel {
    /// Start connecting in the background.
    ///
    /// Accepted locations are published through `writer`. The task runs
    /// until `cancel` fires or [`Self::shutdown`] is called.
    pub fn spawn(
        config: ChannelConfig,
        identity: Arc<Identity>,
        writer: LocationWriter,
        cancel: CancellationToken,
    ) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let location = writer.subscribe();
        let task = tokio::spawn(run_connection_loop(
            config,
            identity,
            writer,
            Arc::clone(&connected),
            cancel.clone(),
        ));
        Self {
            connected,
            location,
            cancel,
            task,
        }
    }

    /// Whether a registered connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Latest accepted location, if any.
    pub fn current_location(&self) -> Option<ReceivedLocation> {
        self.location.latest()
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::warn!("[Channel] Task ended abnormally: {e}");
        }
    }
}

async fn run_connection_loop(
    config: ChannelConfig,
    identity: Arc<Identity>,
    writer: LocationWriter,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        log::info!("[Channel] Connecting to {}", config.relay_url);

        let dialed = tokio::select! {
            () = cancel.cancelled() => break,
            result = ws::connect(&config.relay_url) => result,
        };

        match dialed {
            Ok((mut ws_writer, mut ws_reader)) => {
                let register = RegisterMessage::signed(&identity.signing_key).to_frame();
                if let Err(e) = ws_writer.send_text(&register).await {
                    log::warn!("[Channel] Failed to send registration: {e}");
                } else {
                    log::info!(
                        "[Channel] Connected and registered as {}",
                        identity.fingerprint
                    );
                    connected.store(true, Ordering::Release);

                    let exit = run_message_loop(
                        &config,
                        &writer,
                        &mut ws_writer,
                        &mut ws_reader,
                        &cancel,
                    )
                    .await;

                    connected.store(false, Ordering::Release);
                    if let ConnectionLoopExit::Shutdown = exit {
                        break;
                    }
                }
            }
            Err(e) => {
                log::warn!("[Channel] Connection failed: {e:#}");
            }
        }

        log::info!(
            "[Channel] Disconnected, reconnecting in {}ms",
            config.reconnect_delay.as_millis()
        );
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    log::info!("[Channel] Stopped");
}

async fn run_message_loop(
    config: &ChannelConfig,
    location: &LocationWriter,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    cancel: &CancellationToken,
) -> ConnectionLoopExit {
    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                log::info!("[Channel] Shutdown requested, closing connection");
                let _ = writer.close().await;
                return ConnectionLoopExit::Shutdown;
            }

            _ = heartbeat.tick() => {
                if let Err(e) = writer.send_text(&protocol::heartbeat_frame()).await {
                    log::warn!("[Channel] Failed to send heartbeat: {e}");
                    return ConnectionLoopExit::Disconnected;
                }
                log::trace!("[Channel] Heartbeat sent");
            }

            msg = reader.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(config, &text, location);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = writer.send_pong(data).await;
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Channel] Connection closed by relay ({code} {reason})");
                        return ConnectionLoopExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Channel] WebSocket error: {e}");
                        return ConnectionLoopExit::Disconnected;
                    }
                    None => {
                        log::info!("[Channel] WebSocket stream ended");
                        return ConnectionLoopExit::Disconnected;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Apply one relayed frame to the latest location.
pub fn handle_frame(config: &ChannelConfig, text: &str, location: &LocationWriter) -> FrameDisposition {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("[Channel] Ignoring undecodable frame: {e}");
            return FrameDisposition::Rejected;
        }
    };

    match protocol::frame_type(&frame) {
        Some(TYPE_LOCATION) => {}
        Some(TYPE_HEARTBEAT) => return FrameDisposition::Ignored,
        other => {
            log::debug!("[Channel] Ignoring frame of type {other:?}");
            return FrameDisposition::Ignored;
        }
    }

    if config.verify_signatures {
        let verified = config
            .publisher_key
            .as_ref()
            .is_some_and(|key| protocol::verify_payload(&frame, key));
        if !verified {
            log::warn!("[Channel] Dropping location with missing or invalid signature");
            return FrameDisposition::Rejected;
        }
    }

    match serde_json::from_value::<LocationUpdate>(frame) {
        Ok(update) => {
            log::info!("[Channel] Received location update");
            log::debug!(
                "[Channel] Location {}, {} at {}",
                update.latitude,
                update.longitude,
                update.timestamp
            );
            location.publish(update);
            FrameDisposition::Accepted
        }
        Err(e) => {
            log::warn!("[Channel] Ignoring invalid location frame: {e}");
            FrameDisposition::Rejected
        }
    }
}
