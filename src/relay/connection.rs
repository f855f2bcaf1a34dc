//! Per-connection state machine of the relay.
//!
//! ```text
//!   accept ──► Registering ──register ok──► Authenticated ──► (closed)
//!                  │                            │
//!                  │ wrong frame / bad key /    │ silence > liveness window
//!                  │ bad signature / deadline   │ malformed / violation
//!                  ▼                            ▼
//!               close 1008 / 1011          close 1008 / 1011, or drop
//! ```
//!
//! [`handle_text`] is the pure transition function; [`serve`] drives it
//! against a socket, the connection's timers and its outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::allow_list::{AllowList, AuthenticatedPeer};
use super::error::RelayError;
use super::registry::{Activity, Outbound, PeerRegistry};
use super::RelayTiming;
use crate::protocol::{self, RegisterMessage, TYPE_HEARTBEAT, TYPE_REGISTER};
use crate::ws::{WsMessage, WsReader, WsWriter};

/// Upper bound on delivering a close frame to a peer that may not be reading.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a `register` frame.
    Registering,
    /// Identity bound; frames are relayed.
    Authenticated(AuthenticatedPeer),
}

/// What to do with one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Registration succeeded; bind this identity.
    Registered(AuthenticatedPeer),
    /// Accepted and not forwarded (heartbeat).
    Consumed,
    /// Forward the received text unchanged to every other authenticated peer.
    Broadcast,
    /// Terminate the connection.
    Close(RelayError),
}

/// Policy knobs applied while handling frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePolicy {
    /// Require a valid payload signature on every relayed frame.
    pub require_signed_payloads: bool,
}

/// Decide what to do with `text` given the connection's `state`.
pub fn handle_text(
    state: &ConnectionState,
    text: &str,
    allow_list: &AllowList,
    policy: FramePolicy,
) -> FrameOutcome {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return FrameOutcome::Close(RelayError::MalformedFrame);
    };
    if !frame.is_object() {
        return FrameOutcome::Close(RelayError::MalformedFrame);
    }
    let kind = protocol::frame_type(&frame);

    match state {
        ConnectionState::Registering => {
            if kind != Some(TYPE_REGISTER) {
                return FrameOutcome::Close(RelayError::protocol("Expected register message"));
            }
            let Ok(message) = serde_json::from_value::<RegisterMessage>(frame) else {
                return FrameOutcome::Close(RelayError::protocol("Incomplete register message"));
            };
            match allow_list.authenticate(&message) {
                Ok(peer) => FrameOutcome::Registered(peer),
                Err(err) => FrameOutcome::Close(err),
            }
        }
        ConnectionState::Authenticated(peer) => match kind {
            Some(TYPE_HEARTBEAT) => FrameOutcome::Consumed,
            Some(TYPE_REGISTER) => FrameOutcome::Close(RelayError::protocol("Already registered")),
            _ if policy.require_signed_payloads
                && !protocol::verify_payload(&frame, &peer.verifying_key) =>
            {
                FrameOutcome::Close(RelayError::InvalidSignature)
            }
            _ => FrameOutcome::Broadcast,
        },
    }
}

/// Shared inputs for every connection task.
#[derive(Debug)]
pub struct ConnectionContext {
    /// Identities allowed to register.
    pub allow_list: AllowList,
    /// Live connections.
    pub registry: PeerRegistry,
    /// Deadlines.
    pub timing: RelayTiming,
    /// Frame policy.
    pub policy: FramePolicy,
}

/// Drive one upgraded connection until it ends.
pub async fn serve<S>(
    mut writer: WsWriter<S>,
    mut reader: WsReader<S>,
    addr: SocketAddr,
    accepted_at: Instant,
    context: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut slot = context.registry.register_connection();
    let id = slot.id;
    let mut state = ConnectionState::Registering;
    let mut deadline = accepted_at + context.timing.registration_timeout;

    log::debug!("[Relay] Connection #{id} from {addr} awaiting registration");

    let outcome: Option<RelayError> = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = writer.close().await;
                break None;
            }

            () = slot.kill.cancelled() => {
                break Some(RelayError::LivenessTimeout);
            }

            () = tokio::time::sleep_until(deadline) => {
                break Some(match state {
                    ConnectionState::Registering => RelayError::RegistrationTimeout,
                    ConnectionState::Authenticated(_) => RelayError::LivenessTimeout,
                });
            }

            Some(item) = slot.outbound.recv() => {
                let send = async {
                    match item {
                        Outbound::Frame(frame) => writer.send_text(&frame).await,
                        Outbound::Ping => writer.send_ping(Vec::new()).await,
                    }
                };
                // A peer that stops reading blocks the write; the same
                // deadline and kill token still apply while it is pending
                tokio::select! {
                    () = slot.kill.cancelled() => break Some(RelayError::LivenessTimeout),
                    sent = tokio::time::timeout_at(deadline, send) => match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            log::debug!("[Relay] Connection #{id} send failed: {e}");
                            break None;
                        }
                        Err(_) => break Some(match state {
                            ConnectionState::Registering => RelayError::RegistrationTimeout,
                            ConnectionState::Authenticated(_) => RelayError::LivenessTimeout,
                        }),
                    },
                }
            }

            msg = reader.recv() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(_))) => {
                        break Some(RelayError::protocol("Binary frames are not supported"));
                    }
                    Some(Ok(WsMessage::Undecodable(e))) => {
                        log::debug!("[Relay] Connection #{id} sent an undecodable frame: {e}");
                        break Some(RelayError::MalformedFrame);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        refresh(&state, &slot.activity, &mut deadline, &context.timing);
                        let _ = writer.send_pong(data).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        refresh(&state, &slot.activity, &mut deadline, &context.timing);
                        continue;
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Relay] Connection #{id} closed by peer ({code} {reason})");
                        break None;
                    }
                    Some(Err(e)) => {
                        log::info!("[Relay] Connection #{id} transport error: {e}");
                        break None;
                    }
                    None => break None,
                };

                refresh(&state, &slot.activity, &mut deadline, &context.timing);

                match handle_text(&state, &text, &context.allow_list, context.policy) {
                    FrameOutcome::Registered(peer) => {
                        log::info!(
                            "[Relay] Connection #{id} registered as {} ({})",
                            peer.role,
                            crate::identity::compute_fingerprint(&peer.verifying_key)
                        );
                        context.registry.mark_authenticated(id, peer.role);
                        state = ConnectionState::Authenticated(peer);
                        deadline = Instant::now() + context.timing.liveness_window;
                    }
                    FrameOutcome::Consumed => {
                        log::trace!("[Relay] Heartbeat from #{id}");
                    }
                    FrameOutcome::Broadcast => {
                        let frame: Arc<str> = Arc::from(text);
                        let delivered = context.registry.broadcast_except(id, &frame);
                        log::debug!("[Relay] Relayed frame from #{id} to {delivered} peer(s)");
                    }
                    FrameOutcome::Close(err) => break Some(err),
                }
            }
        }
    };

    context.registry.remove(id);

    let Some(err) = outcome else {
        log::debug!("[Relay] Connection #{id} ended");
        return;
    };

    match err.close_code() {
        Some(code) => {
            log::warn!("[Relay] Closing connection #{id} from {addr}: {code} {err}");
            let reason = err.to_string();
            match tokio::time::timeout(CLOSE_SEND_TIMEOUT, writer.send_close(code, &reason)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("[Relay] Close frame to #{id} not delivered: {e}"),
                Err(_) => log::debug!("[Relay] Close frame to #{id} timed out"),
            }
        }
        None => {
            log::warn!("[Relay] Terminating connection #{id} from {addr}: {err}");
        }
    }
}

/// Record inbound activity. Only authenticated connections extend their
/// deadline; the registration deadline is fixed.
fn refresh(
    state: &ConnectionState,
    activity: &Activity,
    deadline: &mut Instant,
    timing: &RelayTiming,
) {
    activity.touch();
    if matches!(state, ConnectionState::Authenticated(_)) {
        *deadline = Instant::now() + timing.liveness_window;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::protocol::{heartbeat_frame, LocationUpdate};
    use crate::relay::PeerRole;

    struct Fixture {
        publisher: Identity,
        allow_list: AllowList,
    }

    fn fixture() -> Fixture {
        let publisher = Identity::generate();
        let mut allow_list = AllowList::default();
        allow_list
            .insert(PeerRole::Publisher, &publisher.public_key_base64())
            .unwrap();
        Fixture {
            publisher,
            allow_list,
        }
    }

    fn authenticated(f: &Fixture) -> ConnectionState {
        let frame = RegisterMessage::signed(&f.publisher.signing_key).to_frame();
        match handle_text(
            &ConnectionState::Registering,
            &frame,
            &f.allow_list,
            FramePolicy::default(),
        ) {
            FrameOutcome::Registered(peer) => ConnectionState::Authenticated(peer),
            other => panic!("expected registration, got {other:?}"),
        }
    }

    #[test]
    fn test_registration_binds_role() {
        let f = fixture();
        match authenticated(&f) {
            ConnectionState::Authenticated(peer) => assert_eq!(peer.role, PeerRole::Publisher),
            ConnectionState::Registering => unreachable!(),
        }
    }

    #[test]
    fn test_non_register_before_auth_is_violation() {
        let f = fixture();
        let outcome = handle_text(
            &ConnectionState::Registering,
            &heartbeat_frame(),
            &f.allow_list,
            FramePolicy::default(),
        );
        assert_eq!(
            outcome,
            FrameOutcome::Close(RelayError::protocol("Expected register message"))
        );
    }

    #[test]
    fn test_register_missing_signature_is_violation() {
        let f = fixture();
        let text = serde_json::json!({
            "type": "register",
            "publicKey": f.publisher.public_key_base64(),
        })
        .to_string();
        let outcome = handle_text(
            &ConnectionState::Registering,
            &text,
            &f.allow_list,
            FramePolicy::default(),
        );
        assert!(matches!(
            outcome,
            FrameOutcome::Close(RelayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_malformed_in_any_state() {
        let f = fixture();
        for state in [ConnectionState::Registering, authenticated(&f)] {
            for text in ["{not json", "[1,2,3]", "\"register\""] {
                assert_eq!(
                    handle_text(&state, text, &f.allow_list, FramePolicy::default()),
                    FrameOutcome::Close(RelayError::MalformedFrame),
                    "{text}"
                );
            }
        }
    }

    #[test]
    fn test_authenticated_heartbeat_consumed_location_broadcast() {
        let f = fixture();
        let state = authenticated(&f);

        assert_eq!(
            handle_text(&state, &heartbeat_frame(), &f.allow_list, FramePolicy::default()),
            FrameOutcome::Consumed
        );
        let location = LocationUpdate::now(1.0, 2.0).to_frame(None);
        assert_eq!(
            handle_text(&state, &location, &f.allow_list, FramePolicy::default()),
            FrameOutcome::Broadcast
        );
    }

    #[test]
    fn test_second_register_is_violation() {
        let f = fixture();
        let state = authenticated(&f);
        let frame = RegisterMessage::signed(&f.publisher.signing_key).to_frame();
        assert_eq!(
            handle_text(&state, &frame, &f.allow_list, FramePolicy::default()),
            FrameOutcome::Close(RelayError::protocol("Already registered"))
        );
    }

    #[test]
    fn test_signed_payload_policy() {
        let f = fixture();
        let state = authenticated(&f);
        let policy = FramePolicy {
            require_signed_payloads: true,
        };

        let unsigned = LocationUpdate::now(1.0, 2.0).to_frame(None);
        assert_eq!(
            handle_text(&state, &unsigned, &f.allow_list, policy),
            FrameOutcome::Close(RelayError::InvalidSignature)
        );

        let signed = LocationUpdate::now(1.0, 2.0).to_frame(Some(&f.publisher.signing_key));
        assert_eq!(
            handle_text(&state, &signed, &f.allow_list, policy),
            FrameOutcome::Broadcast
        );

        // Heartbeats are never checked
        assert_eq!(
            handle_text(&state, &heartbeat_frame(), &f.allow_list, policy),
            FrameOutcome::Consumed
        );
    }
}
