//! Live cache: latest decoded values per tank
//!
//! Process-wide snapshot map with one writer (the poll worker that owns the
//! tank this tick) and many readers (the API). Entries are replaced whole, so
//! a reader never observes a half-updated snapshot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::family::FamilyId;
use crate::frame::{QcStatus, TelemetryFrame};

/// Latest known state of one tank
#[derive(Debug, Clone, Serialize)]
pub struct LiveSnapshot {
    pub family: FamilyId,
    pub ip: String,
    /// None until the first poll completes (pre-seeded utility entries)
    pub ts_utc: Option<DateTime<Utc>>,
    pub qc: QcStatus,
    #[serde(flatten)]
    pub values: HashMap<String, f64>,
}

/// Snapshot map keyed by tank id.
#[derive(Default)]
pub struct LiveCache {
    entries: DashMap<String, LiveSnapshot>,
}

impl LiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for a tank with this frame's state.
    pub fn update(&self, tank_id: &str, family: FamilyId, ip: &str, frame: &TelemetryFrame) {
        self.entries.insert(
            tank_id.to_string(),
            LiveSnapshot {
                family,
                ip: ip.to_string(),
                ts_utc: Some(frame.ts_utc),
                qc: frame.qc.status,
                values: frame.s.clone(),
            },
        );
    }

    /// Pre-seed an entry so the API surface is stable before the first poll.
    /// Never overwrites real data.
    pub fn seed(&self, tank_id: &str, family: FamilyId, ip: &str) {
        self.entries
            .entry(tank_id.to_string())
            .or_insert_with(|| LiveSnapshot {
                family,
                ip: ip.to_string(),
                ts_utc: None,
                qc: QcStatus::Fail,
                values: HashMap::new(),
            });
    }

    pub fn get(&self, tank_id: &str) -> Option<LiveSnapshot> {
        self.entries.get(tank_id).map(|e| e.value().clone())
    }

    /// All snapshots, keyed and ordered by tank id for stable JSON output.
    pub fn all(&self) -> BTreeMap<String, LiveSnapshot> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
