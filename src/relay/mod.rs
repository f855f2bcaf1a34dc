//! Relay hub.
//!
//! Accepts WebSocket connections, authenticates each one against a static
//! allow-list of Ed25519 public keys, then relays every non-heartbeat frame
//! verbatim to all other authenticated connections.
//!
//! # Architecture
//!
//! ```text
//!   TcpListener ──accept──► connection task (one per socket)
//!                               │  handle_text() state machine
//!                               ▼
//!                           PeerRegistry ──mpsc──► other connection tasks
//!                               ▲
//!   sweep task ─────────────────┘  (pings everyone, kills connections silent past the window)
//! ```
//!
//! Each connection task owns its socket and both of its timers, so a slow or
//! misbehaving peer never stalls the others. Trust is established once at
//! registration; authenticated traffic is not re-verified unless
//! `requireSignedPayloads` is set.

pub mod allow_list;
pub mod connection;
pub mod error;
pub mod registry;

pub use allow_list::{AllowList, AuthenticatedPeer, PeerRole};
pub use connection::{ConnectionState, FrameOutcome, FramePolicy};
pub use error::RelayError;
pub use registry::{PeerId, PeerRegistry};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use connection::ConnectionContext;

/// How long shutdown waits for connection tasks to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Reply to a plain `GET /health` on the relay port.
const HEALTH_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 15\r\nConnection: close\r\n\r\n{\"status\":\"ok\"}";

/// Start of a health check request, lowercased.
const HEALTH_REQUEST_LINE: &[u8] = b"get /health ";

/// Pause between peeks while a request is still arriving.
const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Relay deadlines.
#[derive(Debug, Clone, Copy)]
pub struct RelayTiming {
    /// Time from TCP accept until a valid `register` frame.
    pub registration_timeout: Duration,
    /// Maximum silence from an authenticated connection.
    pub liveness_window: Duration,
    /// Interval of the coarse liveness sweep.
    pub sweep_interval: Duration,
}

impl RelayTiming {
    /// Silence after which the sweep terminates a connection.
    ///
    /// Never shorter than the liveness window, so the sweep only catches
    /// connections the per-connection timer has already given up on.
    pub fn sweep_max_silence(&self) -> Duration {
        self.liveness_window.max(self.sweep_interval)
    }
}

impl From<&RelayConfig> for RelayTiming {
    fn from(config: &RelayConfig) -> Self {
        Self {
            registration_timeout: config.registration_timeout,
            liveness_window: config.liveness_window,
            sweep_interval: config.sweep_interval,
        }
    }
}

/// A bound relay, ready to [`run`](Self::run).
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    context: Arc<ConnectionContext>,
}

impl RelayServer {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let allow_list =
            AllowList::from_config(config).context("Relay allow-list contains an invalid key")?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind relay to {}", config.bind_addr))?;

        log::info!(
            "[Relay] Listening on {} ({} allow-listed keys)",
            listener.local_addr()?,
            allow_list.len()
        );

        Ok(Self {
            listener,
            context: Arc::new(ConnectionContext {
                allow_list,
                registry: PeerRegistry::new(),
                timing: RelayTiming::from(config),
                policy: FramePolicy {
                    require_signed_payloads: config.require_signed_payloads,
                },
            }),
        })
    }

    /// Address the relay is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Relay listener has no local address")
    }

    /// Handle on the connection table, for inspection.
    pub fn registry(&self) -> PeerRegistry {
        self.context.registry.clone()
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        let sweep = tokio::spawn(run_sweep(
            self.context.registry.clone(),
            self.context.timing,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            connections.spawn(handle_socket(
                                stream,
                                addr,
                                Arc::clone(&self.context),
                                shutdown.child_token(),
                            ));
                        }
                        Err(e) => log::warn!("[Relay] Accept failed: {e}"),
                    }
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("[Relay] Connection task failed: {e}");
                    }
                }
            }
        }

        log::info!(
            "[Relay] Shutting down, closing {} connection(s) (authenticated: {:?})",
            connections.len(),
            self.context.registry.roles()
        );
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            connections.abort_all();
        }
        let _ = sweep.await;
        Ok(())
    }
}

async fn handle_socket(
    mut stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) {
    let accepted_at = Instant::now();
    let upgrade_deadline = accepted_at + context.timing.registration_timeout;

    let probe = tokio::time::timeout_at(upgrade_deadline, is_health_probe(&stream));
    if let Ok(true) = probe.await {
        // Drain the request so closing does not reset the connection
        let mut request = [0u8; 1024];
        let _ = stream.read(&mut request).await;
        if let Err(e) = stream.write_all(HEALTH_RESPONSE).await {
            log::debug!("[Relay] Health probe from {addr} failed: {e}");
        }
        let _ = stream.shutdown().await;
        return;
    }

    let upgrade = tokio::time::timeout_at(upgrade_deadline, crate::ws::accept(stream));
    let (writer, reader) = match upgrade.await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            log::debug!("[Relay] Rejected non-WebSocket client {addr}: {e}");
            return;
        }
        Err(_) => {
            log::debug!("[Relay] Client {addr} did not finish the WebSocket upgrade");
            return;
        }
    };

    connection::serve(writer, reader, addr, accepted_at, context, shutdown).await;
}

/// True when the first bytes on `stream` are a plain HTTP `GET /health`.
///
/// Peeks until the request headers are complete, so a request split over
/// several segments is still recognised. Any other request is rejected as
/// soon as its first bytes diverge.
async fn is_health_probe(stream: &TcpStream) -> bool {
    let mut head = [0u8; 1024];
    let mut seen = 0;
    loop {
        let Ok(n) = stream.peek(&mut head).await else {
            return false;
        };
        if n == 0 {
            return false;
        }
        let request = head[..n].to_ascii_lowercase();
        let common = n.min(HEALTH_REQUEST_LINE.len());
        if request[..common] != HEALTH_REQUEST_LINE[..common] {
            return false;
        }
        let headers_done = find(&request, b"\r\n\r\n").is_some();
        if headers_done || n == head.len() {
            return find(&request, b"upgrade: websocket").is_none();
        }
        if n == seen {
            tokio::time::sleep(PEEK_RETRY).await;
        }
        seen = n;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn run_sweep(registry: PeerRegistry, timing: RelayTiming, shutdown: CancellationToken) {
    let period = timing.sweep_interval;
    let max_silence = timing.sweep_max_silence();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let killed = registry.sweep(max_silence);
                if killed > 0 {
                    log::info!("[Relay] Sweep terminated {killed} connection(s)");
                }
            }
        }
    }
}
