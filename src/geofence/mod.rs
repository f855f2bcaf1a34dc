//! Geofence rules and their scheduling.
//!
//! - [`rule`] - rule configuration and the pure fire/no-fire decision
//! - [`scheduler`] - one cancellable loop task per rule

pub mod rule;
pub mod scheduler;

pub use rule::{
    ConditionKind, Decision, GeofenceRule, LocationCondition, NamedLocation,
    WAITING_FOR_INITIAL_DATA,
};
pub use scheduler::{Scheduler, SchedulerContext, SchedulerOptions};
