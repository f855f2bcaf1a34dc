//! Headless location publisher.
//!
//! Performs the same handshake as any other peer, sends one `location`
//! frame and closes. Used by operators to inject a location without the
//! browser client.

use anyhow::{Context, Result};

use crate::identity::Identity;
use crate::protocol::{LocationUpdate, RegisterMessage};
use crate::ws;

/// Register with the relay at `relay_url` and publish `update`.
///
/// With `sign` set, the frame carries a payload signature made with the
/// publisher's key.
pub async fn publish_location(
    relay_url: &str,
    identity: &Identity,
    update: &LocationUpdate,
    sign: bool,
) -> Result<()> {
    let url = ws::http_to_ws_scheme(relay_url);
    let (mut writer, _reader) = ws::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to relay at {url}"))?;

    writer
        .send_text(&RegisterMessage::signed(&identity.signing_key).to_frame())
        .await
        .context("Failed to send registration")?;

    let frame = update.to_frame(sign.then_some(&identity.signing_key));
    writer
        .send_text(&frame)
        .await
        .context("Failed to send location")?;

    log::info!(
        "[Publisher] Sent location as {} ({}signed)",
        identity.fingerprint,
        if sign { "" } else { "un" }
    );
    log::debug!(
        "[Publisher] {}, {} at {}",
        update.latitude,
        update.longitude,
        update.timestamp
    );

    writer.close().await.context("Failed to close relay connection")?;
    Ok(())
}
