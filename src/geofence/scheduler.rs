//! One independent evaluation loop per geofence rule.
//!
//! # Loop shape
//!
//! ```text
//!   start_rule(i)
//!       │  sleep(initial_delay)
//!       ▼
//!   ┌─► sleep(polling_interval)            ◄── measured from *now*, so
//!   │       │                                  ticks drift by tick cost
//!   │       ▼
//!   │   evaluate(latest location)
//!   │       │ should_fire
//!   │       ▼
//!   │   dispatcher.dispatch(path, args)    ◄── never awaited
//!   └───────┘
//! ```
//!
//! Every sleep races the shared cancellation token, so shutdown stops all
//! loops promptly. Actions already launched are not cancelled.
//!
//! Rules share nothing mutable. The only shared state is the read-only
//! [`SchedulerContext`] (location reader, dispatcher, options).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::rule::GeofenceRule;
use crate::action::{ActionHandle, Dispatcher};
use crate::location::LocationReader;

/// Behaviour switches for the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerOptions {
    /// Skip a tick while the rule's previous action is still running.
    ///
    /// Off by default: overlapping actions are launched concurrently when
    /// an action outlives the polling interval.
    pub skip_overlapping_actions: bool,
}

/// Shared, read-only state handed to every rule task.
#[derive(Debug)]
pub struct SchedulerContext {
    /// Latest location from the channel client.
    pub location: LocationReader,
    /// Action launcher.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Behaviour switches.
    pub options: SchedulerOptions,
}

/// Owns one loop task per started rule.
#[derive(Debug)]
pub struct Scheduler {
    rules: Vec<Arc<GeofenceRule>>,
    context: Arc<SchedulerContext>,
    tasks: HashMap<usize, JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler for `rules`. Nothing runs until [`Self::start_all`]
    /// or [`Self::start_rule`].
    pub fn new(rules: Vec<GeofenceRule>, context: SchedulerContext, cancel: CancellationToken) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            context: Arc::new(context),
            tasks: HashMap::new(),
            cancel,
        }
    }

    /// Start every configured rule.
    pub fn start_all(&mut self) {
        for index in 0..self.rules.len() {
            self.start_rule(index);
        }
    }

    /// Start the loop for rule `index`.
    ///
    /// Returns `false` without doing anything if the rule is already
    /// running or does not exist.
    pub fn start_rule(&mut self, index: usize) -> bool {
        if self.tasks.contains_key(&index) {
            log::debug!("[Scheduler] Rule #{index} already running");
            return false;
        }
        let Some(rule) = self.rules.get(index) else {
            log::warn!("[Scheduler] No rule #{index}");
            return false;
        };

        log::info!(
            "[Scheduler] Scheduling {} to start in {}ms",
            rule.path,
            rule.initial_delay.as_millis()
        );

        let task = tokio::spawn(run_rule(
            index,
            Arc::clone(rule),
            Arc::clone(&self.context),
            self.cancel.child_token(),
        ));
        self.tasks.insert(index, task);
        true
    }

    /// Number of rules with a live loop.
    pub fn running_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for (index, task) in self.tasks.drain() {
            if let Err(e) = task.await {
                log::warn!("[Scheduler] Rule #{index} task ended abnormally: {e}");
            }
        }
        log::info!("[Scheduler] All rule loops stopped");
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancel.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep_until(Instant::now() + duration) => true,
    }
}

async fn run_rule(
    index: usize,
    rule: Arc<GeofenceRule>,
    context: Arc<SchedulerContext>,
    cancel: CancellationToken,
) {
    if !sleep_or_cancel(rule.initial_delay, &cancel).await {
        return;
    }

    log::info!(
        "[Scheduler] Starting rule #{} ({}) every {}ms",
        index,
        rule.path,
        rule.polling_interval.as_millis()
    );

    let mut in_flight: Option<ActionHandle> = None;

    while sleep_or_cancel(rule.polling_interval, &cancel).await {
        let latest = context.location.latest();
        let decision = rule.evaluate(latest.as_ref().map(|l| &l.update), Utc::now());

        for reason in &decision.reasons {
            log::debug!("[Scheduler] Rule #{index}: {reason}");
        }

        if !decision.should_fire {
            continue;
        }

        if context.options.skip_overlapping_actions
            && in_flight.as_ref().is_some_and(|h| !h.is_finished())
        {
            log::info!(
                "[Scheduler] Rule #{index} skipped: previous action for {} still running",
                rule.path
            );
            continue;
        }

        log::info!(
            "[Scheduler] Rule #{index} firing {}: {}",
            rule.path,
            decision.reasons.join("; ")
        );
        in_flight = Some(context.dispatcher.dispatch(&rule.path, &rule.args));
    }

    log::debug!("[Scheduler] Rule #{index} stopped");
}
