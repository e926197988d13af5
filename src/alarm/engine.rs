//! Stateful alarm evaluation and batched notification egress

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::notify::AlarmNotifier;
use super::rules::{seeded_rules, AlarmConfig, AlarmKind, AlarmRule, Severity};
use crate::error::Result;
use crate::family::FamilyId;
use crate::frame::{QcStatus, TelemetryFrame};

/// Edge direction of an alarm event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Alarm,
    Resolved,
}

/// One edge produced by rule evaluation
#[derive(Debug, Clone, Serialize)]
pub struct AlarmEvent {
    pub kind: EventKind,
    pub rule_id: String,
    pub family: FamilyId,
    pub tank_id: String,
    pub severity: Severity,
    pub detail: String,
    pub ts: DateTime<Utc>,
}

/// Per-(rule, tank) edge state
#[derive(Debug, Clone)]
struct AlarmState {
    active: bool,
    last_change: DateTime<Utc>,
}

/// Per-tank connectivity tracking feeding the qc_fail rule
#[derive(Debug, Clone, Default)]
struct ConnectivityState {
    last_ok: Option<DateTime<Utc>>,
    first_fail: Option<DateTime<Utc>>,
    consecutive_fails: u32,
}

/// The alarm engine. Mutation happens only here; the poll workers call
/// [`evaluate_frame`](AlarmEngine::evaluate_frame) and the tick driver calls
/// [`flush`](AlarmEngine::flush) once per tick.
pub struct AlarmEngine {
    thresholds: RwLock<AlarmConfig>,
    settings_path: PathBuf,
    connectivity_alarm_ms: i64,
    site_id: String,
    states: Mutex<HashMap<(String, String), AlarmState>>,
    connectivity: Mutex<HashMap<String, ConnectivityState>>,
    pending: Mutex<Vec<AlarmEvent>>,
    notifier: Option<Arc<dyn AlarmNotifier>>,
}

impl AlarmEngine {
    pub fn new(
        settings_path: PathBuf,
        connectivity_alarm_ms: i64,
        site_id: String,
        notifier: Option<Arc<dyn AlarmNotifier>>,
    ) -> Result<Self> {
        let thresholds = AlarmConfig::load(&settings_path)?;
        Ok(AlarmEngine {
            thresholds: RwLock::new(thresholds),
            settings_path,
            connectivity_alarm_ms,
            site_id,
            states: Mutex::new(HashMap::new()),
            connectivity: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            notifier,
        })
    }

    /// Evaluate every applicable rule against one frame.
    pub fn evaluate_frame(
        &self,
        family: FamilyId,
        tank_id: &str,
        frame: &TelemetryFrame,
        now: DateTime<Utc>,
    ) {
        let (rules, qc_enabled) = {
            let guard = match self.thresholds.read() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            (seeded_rules(&guard), guard.connectivity.qc_alarms_enabled)
        };

        for rule in &rules {
            if let Some(rule_family) = rule.family {
                if rule_family != family {
                    continue;
                }
            }
            match rule.kind {
                AlarmKind::MetricThreshold => {
                    self.evaluate_metric(rule, family, tank_id, frame, now)
                },
                AlarmKind::QcFail => {
                    // Master toggle off: skip entirely, do not touch state.
                    if qc_enabled {
                        self.evaluate_connectivity(rule, family, tank_id, frame, now);
                    }
                },
            }
        }
    }

    fn evaluate_metric(
        &self,
        rule: &AlarmRule,
        family: FamilyId,
        tank_id: &str,
        frame: &TelemetryFrame,
        now: DateTime<Utc>,
    ) {
        let Some(metric) = rule.metric else {
            return;
        };
        let Some(value) = frame.s.get(metric).copied() else {
            return; // missing metric: no evaluation, no transition
        };
        if !value.is_finite() {
            return;
        }

        let active = value < rule.low || value > rule.high;
        let detail = if value < rule.low {
            format!("{metric} {value:.2} below low threshold {:.2}", rule.low)
        } else if value > rule.high {
            format!("{metric} {value:.2} above high threshold {:.2}", rule.high)
        } else {
            format!("{metric} {value:.2} within [{:.2}, {:.2}]", rule.low, rule.high)
        };
        self.apply_transition(rule, family, tank_id, active, detail, now);
    }

    fn evaluate_connectivity(
        &self,
        rule: &AlarmRule,
        family: FamilyId,
        tank_id: &str,
        frame: &TelemetryFrame,
        now: DateTime<Utc>,
    ) {
        let (offline_ms, fails) = {
            let mut guard = match self.connectivity.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let state = guard.entry(tank_id.to_string()).or_default();
            match frame.qc.status {
                QcStatus::Ok => {
                    state.last_ok = Some(now);
                    state.first_fail = None;
                    state.consecutive_fails = 0;
                },
                QcStatus::Fail => {
                    state.consecutive_fails += 1;
                    if state.first_fail.is_none() {
                        state.first_fail = Some(now);
                    }
                },
            }
            let base = state.last_ok.or(state.first_fail).unwrap_or(now);
            ((now - base).num_milliseconds(), state.consecutive_fails)
        };

        let active = offline_ms >= self.connectivity_alarm_ms;
        let detail = format!(
            "offline for {} min after {} failed polls (threshold {} min)",
            offline_ms / 60_000,
            fails,
            self.connectivity_alarm_ms / 60_000
        );
        self.apply_transition(rule, family, tank_id, active, detail, now);
    }

    fn apply_transition(
        &self,
        rule: &AlarmRule,
        family: FamilyId,
        tank_id: &str,
        active: bool,
        detail: String,
        now: DateTime<Utc>,
    ) {
        let key = (rule.id.to_string(), tank_id.to_string());
        let mut states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = states.entry(key).or_insert(AlarmState {
            active: false,
            last_change: now,
        });
        if state.active == active {
            return;
        }
        state.active = active;
        state.last_change = now;
        drop(states);

        let kind = if active {
            EventKind::Alarm
        } else {
            EventKind::Resolved
        };
        debug!(rule = rule.id, tank = tank_id, ?kind, "alarm edge");
        let mut pending = match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.push(AlarmEvent {
            kind,
            rule_id: rule.id.to_string(),
            family,
            tank_id: tank_id.to_string(),
            severity: rule.severity,
            detail,
            ts: now,
        });
    }

    /// Flush the pending batch as one grouped notification.
    ///
    /// Runs once per tick, after every worker has drained. A failed dispatch
    /// is logged and the batch is discarded; retrying would risk notification
    /// storms.
    pub async fn flush(&self) {
        let events: Vec<AlarmEvent> = {
            let mut pending = match self.pending.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *pending)
        };
        if events.is_empty() {
            return;
        }

        let message = render_batch(&self.site_id, &events);
        info!(events = events.len(), "dispatching alarm batch");
        match &self.notifier {
            Some(notifier) => {
                if let Err(e) = notifier.notify(&message).await {
                    warn!("alarm notification failed, batch discarded: {e}");
                }
            },
            None => debug!("no alarm notifier configured, batch dropped:\n{message}"),
        }
    }

    /// Defensive clone of the current thresholds.
    pub fn get_thresholds(&self) -> AlarmConfig {
        match self.thresholds.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate, apply and persist new thresholds.
    pub fn set_thresholds(&self, new: AlarmConfig) -> Result<()> {
        new.validate()?;
        new.save(&self.settings_path)?;
        let mut guard = self
            .thresholds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = new;
        info!("alarm thresholds updated");
        Ok(())
    }

    /// Current edge state for one (rule, tank); false when never evaluated.
    pub fn is_active(&self, rule_id: &str, tank_id: &str) -> bool {
        let states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        states
            .get(&(rule_id.to_string(), tank_id.to_string()))
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Timestamp of the raising edge for a currently active alarm.
    pub fn active_since(&self, rule_id: &str, tank_id: &str) -> Option<DateTime<Utc>> {
        let states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        states
            .get(&(rule_id.to_string(), tank_id.to_string()))
            .filter(|s| s.active)
            .map(|s| s.last_change)
    }

    /// Number of currently active alarms, for the health surface.
    pub fn active_count(&self) -> usize {
        let states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.values().filter(|s| s.active).count()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

/// Render one batch: per-tank blocks, ALARM lines before RESOLVED lines.
fn render_batch(site_id: &str, events: &[AlarmEvent]) -> String {
    let mut groups: BTreeMap<(String, String), Vec<&AlarmEvent>> = BTreeMap::new();
    for event in events {
        groups
            .entry((event.family.to_string(), event.tank_id.clone()))
            .or_default()
            .push(event);
    }

    let mut message = format!("Alarm update for site {site_id}:\n");
    for ((family, tank_id), group) in groups {
        message.push_str(&format!("\ntank {tank_id} ({family}):\n"));
        for event in group.iter().filter(|e| e.kind == EventKind::Alarm) {
            message.push_str(&format!(
                "  ALARM [{:?}] {}: {}\n",
                event.severity, event.rule_id, event.detail
            ));
        }
        for event in group.iter().filter(|e| e.kind == EventKind::Resolved) {
            message.push_str(&format!("  RESOLVED {}: {}\n", event.rule_id, event.detail));
        }
    }
    message
}
