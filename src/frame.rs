//! Telemetry frame model
//!
//! One frame is produced per (device, tick), successful or not, and is never
//! mutated afterwards. The same JSON shape goes to the broker, the live cache
//! and the log writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Quality-control verdict for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QcStatus {
    Ok,
    Fail,
}

/// Quality-control block carried on every frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Qc {
    pub status: QcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one device poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub ts_utc: DateTime<Utc>,
    pub schema_ver: u32,
    pub site_id: String,
    pub tank_id: String,
    /// `<family prefix>-<tank id>`
    pub device_id: String,
    /// Firmware revision when the map exposes one (point `fw_ver`)
    pub fw: Option<String>,
    /// Decoded point values; empty on a failed poll
    pub s: HashMap<String, f64>,
    pub qc: Qc,
}

impl TelemetryFrame {
    /// Successful poll: decoded values plus `qc.status = ok`.
    pub fn ok(
        site_id: &str,
        tank_id: &str,
        device_id: &str,
        schema_ver: u32,
        values: HashMap<String, f64>,
        ts_utc: DateTime<Utc>,
    ) -> Self {
        let fw = values.get("fw_ver").map(|v| format!("{}", *v as i64));
        TelemetryFrame {
            ts_utc,
            schema_ver,
            site_id: site_id.to_string(),
            tank_id: tank_id.to_string(),
            device_id: device_id.to_string(),
            fw,
            s: values,
            qc: Qc {
                status: QcStatus::Ok,
                error: None,
            },
        }
    }

    /// Failed poll: no values, `qc.status = fail` with the transport error.
    ///
    /// Failure frames still flow to the cache, broker and alarm engine so
    /// downstream consumers can detect staleness.
    pub fn fail(
        site_id: &str,
        tank_id: &str,
        device_id: &str,
        schema_ver: u32,
        error: String,
        ts_utc: DateTime<Utc>,
    ) -> Self {
        TelemetryFrame {
            ts_utc,
            schema_ver,
            site_id: site_id.to_string(),
            tank_id: tank_id.to_string(),
            device_id: device_id.to_string(),
            fw: None,
            s: HashMap::new(),
            qc: Qc {
                status: QcStatus::Fail,
                error: Some(error),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.qc.status == QcStatus::Ok
    }
}
