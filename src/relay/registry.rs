//! Table of live relay connections.
//!
//! Each accepted connection gets an entry holding its outbound queue, an
//! activity stamp and a kill token. The connection task owns the socket;
//! the registry only queues frames for it and can ask it to stop.
//!
//! The outbound queue is bounded. A connection that stops draining it is
//! killed instead of buffering without limit.
//!
//! The lock is held for map operations only, never across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::allow_list::PeerRole;

/// Relay-local connection identifier.
pub type PeerId = u64;

/// Frames a connection may have queued before it counts as a slow consumer.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Something another task wants written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A relayed text frame, sent as-is.
    Frame(Arc<str>),
    /// A WebSocket ping from the liveness sweep.
    Ping,
}

/// Time of the last inbound activity on a connection.
#[derive(Debug)]
pub struct Activity {
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        self.last_seen_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    /// Time since the last recorded activity.
    pub fn silent_for(&self) -> Duration {
        let last = self.last_seen_ms.load(Ordering::Acquire);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }
}

#[derive(Debug)]
struct PeerEntry {
    outbound: mpsc::Sender<Outbound>,
    role: Option<PeerRole>,
    activity: Arc<Activity>,
    kill: CancellationToken,
}

#[derive(Debug, Default)]
struct Peers {
    next_id: PeerId,
    entries: HashMap<PeerId, PeerEntry>,
}

/// Connection-side handle returned by [`PeerRegistry::register_connection`].
#[derive(Debug)]
pub struct PeerSlot {
    /// Identifier of the new entry.
    pub id: PeerId,
    /// Frames and pings queued for this connection.
    pub outbound: mpsc::Receiver<Outbound>,
    /// Touched on every inbound frame; read by the sweep.
    pub activity: Arc<Activity>,
    /// Cancelled when the registry gives up on this connection.
    pub kill: CancellationToken,
}

/// Shared table of connections. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<Peers>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an unauthenticated entry for a freshly accepted connection.
    pub fn register_connection(&self) -> PeerSlot {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let activity = Arc::new(Activity::new());
        let kill = CancellationToken::new();

        let mut peers = self.lock();
        peers.next_id += 1;
        let id = peers.next_id;
        peers.entries.insert(
            id,
            PeerEntry {
                outbound: tx,
                role: None,
                activity: Arc::clone(&activity),
                kill: kill.clone(),
            },
        );

        PeerSlot {
            id,
            outbound: rx,
            activity,
            kill,
        }
    }

    /// Bind a role to `id`, making it eligible for fan-out.
    pub fn mark_authenticated(&self, id: PeerId, role: PeerRole) {
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.role = Some(role);
        }
    }

    /// Drop the entry for `id`.
    pub fn remove(&self, id: PeerId) {
        self.lock().entries.remove(&id);
    }

    /// Queue `frame` for every authenticated connection except `sender`.
    ///
    /// A connection whose queue is full is killed and skipped. Returns the
    /// number of connections the frame was queued for.
    pub fn broadcast_except(&self, sender: PeerId, frame: &Arc<str>) -> usize {
        let peers = self.lock();
        let mut queued = 0;
        for (id, entry) in &peers.entries {
            if *id == sender || entry.role.is_none() {
                continue;
            }
            match entry.outbound.try_send(Outbound::Frame(Arc::clone(frame))) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    if !entry.kill.is_cancelled() {
                        log::warn!("[Relay] Connection #{id} is not draining its queue, terminating");
                        entry.kill.cancel();
                    }
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        queued
    }

    /// Number of connections that completed registration.
    pub fn authenticated_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.role.is_some())
            .count()
    }

    /// Number of open connections, authenticated or not.
    pub fn connection_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Roles of the authenticated connections, publishers first.
    pub fn roles(&self) -> Vec<PeerRole> {
        let mut roles: Vec<PeerRole> = self
            .lock()
            .entries
            .values()
            .filter_map(|entry| entry.role)
            .collect();
        roles.sort_by_key(|role| matches!(role, PeerRole::Agent));
        roles
    }

    /// One pass of the coarse liveness sweep.
    ///
    /// Connections silent for at least `max_silence` are killed. Every
    /// other connection is sent a ping so an idle but healthy peer can
    /// answer before the next pass. Returns the number of connections killed.
    pub fn sweep(&self, max_silence: Duration) -> usize {
        let peers = self.lock();
        let mut killed = 0;
        for (id, entry) in &peers.entries {
            let silent = entry.activity.silent_for();
            if silent < max_silence {
                let _ = entry.outbound.try_send(Outbound::Ping);
                continue;
            }
            log::warn!(
                "[Relay] Sweep terminating connection #{id}, silent for {}ms",
                silent.as_millis()
            );
            entry.kill.cancel();
            killed += 1;
        }
        killed
    }
}
