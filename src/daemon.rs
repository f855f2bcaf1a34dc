//! Agent composition root.
//!
//! Wires the location feed, the channel client, the rule scheduler and the
//! action dispatcher together, then waits for shutdown. All shared state is
//! created here and handed down explicitly.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::action::Dispatcher;
use crate::channel::{ChannelConfig, LocationChannel};
use crate::config::AgentConfig;
use crate::geofence::{GeofenceRule, Scheduler, SchedulerContext, SchedulerOptions};
use crate::identity::Identity;
use crate::location::{location_feed, LocationReader};

/// Run the agent until `shutdown` is cancelled.
///
/// Launched actions are left running on shutdown.
pub async fn run_agent(
    config: AgentConfig,
    identity: Arc<Identity>,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: CancellationToken,
) -> Result<()> {
    let channel_config = ChannelConfig::from_agent_config(&config)?;
    let (writer, reader) = location_feed();

    log::info!(
        "[Scheduler] Loaded {} rule(s); agent fingerprint {}",
        config.scripts.len(),
        identity.fingerprint
    );

    let channel = LocationChannel::spawn(
        channel_config,
        identity,
        writer,
        shutdown.child_token(),
    );

    let decision_log = tokio::spawn(log_decisions_on_update(
        config.scripts.clone(),
        reader.clone(),
        shutdown.child_token(),
    ));

    let mut scheduler = Scheduler::new(
        config.scripts,
        SchedulerContext {
            location: reader,
            dispatcher,
            options: SchedulerOptions {
                skip_overlapping_actions: config.skip_overlapping_actions,
            },
        },
        shutdown.child_token(),
    );
    scheduler.start_all();

    shutdown.cancelled().await;
    log::info!("[Scheduler] Shutting down agent");

    scheduler.shutdown().await;
    channel.shutdown().await;
    let _ = decision_log.await;
    Ok(())
}

/// Log every rule's verdict whenever a new location arrives.
///
/// Purely informational: firing only happens on the rule's own tick.
async fn log_decisions_on_update(
    rules: Vec<GeofenceRule>,
    mut reader: LocationReader,
    cancel: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            () = cancel.cancelled() => return,
            changed = reader.changed() => changed,
        };
        if !changed {
            return;
        }

        let Some(latest) = reader.latest() else {
            continue;
        };
        let now = Utc::now();
        for rule in &rules {
            let decision = rule.evaluate(Some(&latest.update), now);
            log::info!(
                "[Scheduler] {} would {}run: {}",
                rule.path,
                if decision.should_fire { "" } else { "not " },
                decision.reasons.join("; ")
            );
        }
    }
}
