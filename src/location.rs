//! The single "latest location" shared between the channel client and rules.
//!
//! Backed by a `tokio::sync::watch` channel: the channel client is the only
//! writer and replaces the whole value on every accepted update; each rule
//! task holds a reader and takes a cloned snapshot per tick. Readers never
//! observe a partially written value and no history is retained.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::protocol::LocationUpdate;

/// A location update together with the time this process accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedLocation {
    /// The update as sent by the publisher.
    pub update: LocationUpdate,
    /// Local receipt time.
    pub received_at: DateTime<Utc>,
}

/// Write side of the location feed.
#[derive(Debug)]
pub struct LocationWriter {
    tx: watch::Sender<Option<ReceivedLocation>>,
}

/// Read side of the location feed. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LocationReader {
    rx: watch::Receiver<Option<ReceivedLocation>>,
}

/// Create an empty feed.
pub fn location_feed() -> (LocationWriter, LocationReader) {
    let (tx, rx) = watch::channel(None);
    (LocationWriter { tx }, LocationReader { rx })
}

impl LocationWriter {
    /// Replace the current location.
    pub fn publish(&self, update: LocationUpdate) {
        self.tx.send_replace(Some(ReceivedLocation {
            update,
            received_at: Utc::now(),
        }));
    }

    /// New reader attached to this feed.
    pub fn subscribe(&self) -> LocationReader {
        LocationReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl LocationReader {
    /// Snapshot of the current location, `None` until the first update.
    pub fn latest(&self) -> Option<ReceivedLocation> {
        self.rx.borrow().clone()
    }

    /// Wait for the next replacement.
    ///
    /// Returns `false` once the writer is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
