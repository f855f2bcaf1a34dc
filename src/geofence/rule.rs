//! Geofence rules and the fire/no-fire decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::millis;
use crate::geo::haversine_distance;
use crate::protocol::LocationUpdate;

/// Reason recorded when no location has been received yet.
pub const WAITING_FOR_INITIAL_DATA: &str = "Waiting for initial location data";

/// A named reference point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLocation {
    /// Label used in log output.
    pub name: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// Whether a condition wants the device inside or outside its radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    /// Satisfied when `distance <= distanceMeters`.
    Within,
    /// Satisfied when `distance > distanceMeters`.
    Beyond,
}

impl ConditionKind {
    /// Apply this kind to a measured distance.
    pub fn is_satisfied(self, distance: f64, threshold: f64) -> bool {
        match self {
            Self::Within => distance <= threshold,
            Self::Beyond => distance > threshold,
        }
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Within => f.write_str("within"),
            Self::Beyond => f.write_str("beyond"),
        }
    }
}

/// One (reference point, radius, within/beyond) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationCondition {
    /// Reference point.
    pub location: NamedLocation,
    /// Radius in meters.
    pub distance_meters: f64,
    /// Inside or outside.
    #[serde(rename = "type")]
    pub kind: ConditionKind,
}

impl LocationCondition {
    /// Distance from `update` to the reference point, and whether the
    /// condition holds there.
    pub fn check(&self, update: &LocationUpdate) -> (f64, bool) {
        let distance = haversine_distance(
            update.latitude,
            update.longitude,
            self.location.latitude,
            self.location.longitude,
        );
        (distance, self.kind.is_satisfied(distance, self.distance_meters))
    }
}

/// A script to launch when any of its conditions holds or data goes stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceRule {
    /// Executable to launch.
    pub path: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Conditions, combined with logical OR.
    pub locations: Vec<LocationCondition>,
    /// Location older than this fires the rule regardless of position.
    #[serde(with = "millis")]
    pub max_location_age: Duration,
    /// Delay between ticks, measured from the end of the previous tick.
    #[serde(with = "millis")]
    pub polling_interval: Duration,
    /// Delay between daemon start and the rule's loop starting.
    #[serde(with = "millis", default)]
    pub initial_delay: Duration,
}

/// Outcome of evaluating a rule once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the rule's action should be launched.
    pub should_fire: bool,
    /// Human-readable explanation, one entry per check made.
    pub reasons: Vec<String>,
}

impl GeofenceRule {
    /// Reject rules that could never evaluate sensibly.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.path.trim().is_empty() {
            anyhow::bail!("rule path is empty");
        }
        if self.locations.is_empty() {
            anyhow::bail!("rule needs at least one location condition");
        }
        if self.polling_interval.is_zero() {
            anyhow::bail!("pollingInterval must be non-zero");
        }
        for condition in &self.locations {
            if !condition.distance_meters.is_finite() || condition.distance_meters < 0.0 {
                anyhow::bail!(
                    "distanceMeters for {} must be a non-negative number",
                    condition.location.name
                );
            }
        }
        Ok(())
    }

    /// Decide whether to fire given the latest location (if any) at `now`.
    ///
    /// No location at all fires. A location older than `max_location_age`
    /// fires without looking at the conditions. Otherwise the rule fires
    /// when at least one condition holds.
    pub fn evaluate(&self, latest: Option<&LocationUpdate>, now: DateTime<Utc>) -> Decision {
        let Some(update) = latest else {
            return Decision {
                should_fire: true,
                reasons: vec![WAITING_FOR_INITIAL_DATA.to_string()],
            };
        };

        let age_ms = now.signed_duration_since(update.timestamp).num_milliseconds();
        let max_age_ms = i64::try_from(self.max_location_age.as_millis()).unwrap_or(i64::MAX);
        if age_ms > max_age_ms {
            return Decision {
                should_fire: true,
                reasons: vec![format!(
                    "Location data older than max age: {age_ms}ms vs rule max age: {max_age_ms}ms"
                )],
            };
        }

        let mut should_fire = false;
        let reasons: Vec<String> = self
            .locations
            .iter()
            .map(|condition| {
                let (distance, met) = condition.check(update);
                should_fire |= met;
                format!(
                    "Condition that device is {} {} metres of {} is {} (distance {:.0}m)",
                    condition.kind,
                    condition.distance_meters,
                    condition.location.name,
                    met,
                    distance
                )
            })
            .collect();

        Decision {
            should_fire,
            reasons,
        }
    }
}
