//! Alarm rule definitions and persisted thresholds

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TankSrvError};
use crate::family::{write_json_atomic, FamilyId};

/// Low/high band for a metric rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Band {
    pub low: f64,
    pub high: f64,
}

impl Band {
    fn validate(&self, name: &str) -> Result<()> {
        if !self.low.is_finite() || !self.high.is_finite() {
            return Err(TankSrvError::invalid_parameter(format!(
                "{name} thresholds must be finite numbers"
            )));
        }
        if self.low >= self.high {
            return Err(TankSrvError::invalid_parameter(format!(
                "{name} low ({}) must be below high ({})",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

/// Connectivity alarm master switch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    #[serde(rename = "qcAlarmsEnabled", default = "default_true")]
    pub qc_alarms_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        ConnectivitySettings {
            qc_alarms_enabled: true,
        }
    }
}

/// Persisted alarm thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub ph: Band,
    pub temp: Band,
    #[serde(default)]
    pub connectivity: ConnectivitySettings,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        AlarmConfig {
            ph: Band { low: 6.8, high: 8.4 },
            temp: Band {
                low: 18.0,
                high: 28.0,
            },
            connectivity: ConnectivitySettings::default(),
        }
    }
}

impl AlarmConfig {
    pub fn validate(&self) -> Result<()> {
        self.ph.validate("ph")?;
        self.temp.validate("temp")?;
        Ok(())
    }

    /// Load from disk; a missing file means factory defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("no alarm settings at {}, using defaults", path.display());
            return Ok(AlarmConfig::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: AlarmConfig = serde_json::from_str(&raw).map_err(|e| {
            TankSrvError::config(format!("malformed alarm settings {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Persist atomically, creating the parent directory when needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, &serde_json::to_value(self)?)
    }
}

/// Alarm severity carried on events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Rule discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    MetricThreshold,
    QcFail,
}

/// One evaluable rule. `family = None` applies to every family.
#[derive(Debug, Clone)]
pub struct AlarmRule {
    pub id: &'static str,
    pub family: Option<FamilyId>,
    pub kind: AlarmKind,
    pub metric: Option<&'static str>,
    pub low: f64,
    pub high: f64,
    pub severity: Severity,
    pub description: &'static str,
}

/// The seeded rule set with bounds taken from the current thresholds.
pub fn seeded_rules(config: &AlarmConfig) -> Vec<AlarmRule> {
    vec![
        AlarmRule {
            id: "ctrl_ph_out_of_range",
            family: Some(FamilyId::Ctrl),
            kind: AlarmKind::MetricThreshold,
            metric: Some("ph"),
            low: config.ph.low,
            high: config.ph.high,
            severity: Severity::Warning,
            description: "tank pH outside configured band",
        },
        AlarmRule {
            id: "ctrl_temp_out_of_range",
            family: Some(FamilyId::Ctrl),
            kind: AlarmKind::MetricThreshold,
            metric: Some("temp1_C"),
            low: config.temp.low,
            high: config.temp.high,
            severity: Severity::Warning,
            description: "tank temperature outside configured band",
        },
        AlarmRule {
            id: "qc_fail",
            family: None,
            kind: AlarmKind::QcFail,
            metric: None,
            low: 0.0,
            high: 0.0,
            severity: Severity::Critical,
            description: "device offline beyond the connectivity threshold",
        },
    ]
}
