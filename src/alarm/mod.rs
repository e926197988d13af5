//! Alarm engine: rule evaluation, edge detection and batched egress
//!
//! Thresholded metric rules and the connectivity rule are evaluated per frame;
//! only active/inactive edges produce events. Events accumulate during a tick
//! and flush as one grouped notification at tick end.

mod engine;
mod notify;
mod rules;

pub use engine::{AlarmEngine, AlarmEvent, EventKind};
pub use notify::{AlarmNotifier, WebhookNotifier};
pub use rules::{AlarmConfig, AlarmKind, AlarmRule, Band, ConnectivitySettings, Severity};
