//! Family loader: device configuration discovery and register map binding
//!
//! Scans the configuration directory for the family files, normalizes the
//! duck-typed device entries into [`Device`] records, applies the
//! device-enable filter and binds each family to its register map. Reload is
//! periodic and idempotent; a failed reload keeps the previous family set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{Result, TankSrvError};
use crate::register_map::{Block, RegisterMap};

/// Family identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyId {
    Ctrl,
    Util,
    Bmm,
}

impl FamilyId {
    /// Device-id prefix used in frames and topics.
    pub fn device_prefix(self) -> &'static str {
        match self {
            FamilyId::Ctrl => "tank",
            FamilyId::Util => "util",
            FamilyId::Bmm => "bmm",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FamilyId::Ctrl => "ctrl",
            FamilyId::Util => "util",
            FamilyId::Bmm => "bmm",
        }
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized device record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub tank_id: String,
    pub ip: String,
    pub unit_id: u8,
    pub port: u16,
}

impl Device {
    pub fn device_id(&self, family: FamilyId) -> String {
        format!("{}-{}", family.device_prefix(), self.tank_id)
    }
}

/// Raw config entry: either a bare IP string or an object with options.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeviceEntry {
    Ip(String),
    Full {
        ip: String,
        #[serde(rename = "unitId", default = "default_unit_id")]
        unit_id: u8,
        #[serde(default = "default_port")]
        port: u16,
    },
}

fn default_unit_id() -> u8 {
    1
}

fn default_port() -> u16 {
    502
}

impl DeviceEntry {
    fn into_device(self, tank_id: String) -> Device {
        match self {
            DeviceEntry::Ip(ip) => Device {
                tank_id,
                ip,
                unit_id: default_unit_id(),
                port: default_port(),
            },
            DeviceEntry::Full { ip, unit_id, port } => Device {
                tank_id,
                ip,
                unit_id,
                port,
            },
        }
    }
}

/// One polled family: devices plus their shared register map context.
#[derive(Clone)]
pub struct Family {
    pub id: FamilyId,
    pub map: Arc<RegisterMap>,
    pub blocks: Vec<Block>,
    pub devices: Vec<Device>,
}

/// CO₂ dosing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Co2Config {
    #[serde(rename = "defaultLpm")]
    pub default_lpm: f64,
    #[serde(rename = "perTank", default)]
    pub per_tank: HashMap<String, f64>,
}

impl Default for Co2Config {
    fn default() -> Self {
        Co2Config {
            default_lpm: 1.0,
            per_tank: HashMap::new(),
        }
    }
}

impl Co2Config {
    fn validate(&self) -> Result<()> {
        if !(self.default_lpm.is_finite() && self.default_lpm > 0.0) {
            return Err(TankSrvError::config(format!(
                "co2 defaultLpm must be positive, got {}",
                self.default_lpm
            )));
        }
        Ok(())
    }
}

/// One loaded generation of configuration.
pub struct FamilySet {
    pub families: Vec<Family>,
    pub enable_map: HashMap<String, bool>,
    pub co2: Co2Config,
}

/// Loads and reloads the family configuration.
pub struct FamilyLoader {
    config_dir: PathBuf,
    bmm_enable_filter: bool,
    current: RwLock<Arc<FamilySet>>,
}

const FAMILY_FILES: &[(&str, FamilyId)] = &[
    ("tankConfig.json", FamilyId::Ctrl),
    ("utilityConfig.json", FamilyId::Util),
    ("bmmConfig.json", FamilyId::Bmm),
];

const ENABLE_FILE: &str = "deviceEnable.json";
const CO2_FILE: &str = "co2Config.json";

impl FamilyLoader {
    /// Perform the initial load; failure here is fatal for startup.
    pub fn new(config_dir: &Path, bmm_enable_filter: bool) -> Result<Self> {
        let set = Self::load(config_dir, bmm_enable_filter)?;
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            bmm_enable_filter,
            current: RwLock::new(Arc::new(set)),
        })
    }

    /// Current family set; cheap to call, shares the loaded generation.
    pub fn current(&self) -> Arc<FamilySet> {
        self.current
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Reload from disk. On failure the previous set is retained.
    pub fn reload(&self) {
        match Self::load(&self.config_dir, self.bmm_enable_filter) {
            Ok(set) => {
                let mut guard = match self.current.write() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard = Arc::new(set);
                info!("family configuration reloaded");
            },
            Err(e) => {
                warn!("family reload failed, keeping previous configuration: {e}");
            },
        }
    }

    fn load(config_dir: &Path, bmm_enable_filter: bool) -> Result<FamilySet> {
        let enable_map = read_enable_map(&config_dir.join(ENABLE_FILE))?;
        let co2 = read_co2(&config_dir.join(CO2_FILE))?;

        // The ctrl/util families share one map; bmm carries its own.
        let mut shared_map: Option<Arc<RegisterMap>> = None;
        let mut families = Vec::new();

        for (file, id) in FAMILY_FILES {
            let path = config_dir.join(file);
            if !path.exists() {
                continue;
            }
            let mut devices = read_devices(&path)?;

            let filtered = *id == FamilyId::Ctrl || (*id == FamilyId::Bmm && bmm_enable_filter);
            if filtered {
                devices.retain(|d| enable_map.get(&d.tank_id).copied().unwrap_or(false));
            }
            if devices.is_empty() {
                warn!(family = %id, "family has no enabled devices, excluded from polling");
                continue;
            }

            let map = match id {
                FamilyId::Bmm => Arc::new(RegisterMap::load(&config_dir.join("registerMap.bmm.json"))?),
                _ => match &shared_map {
                    Some(m) => m.clone(),
                    None => {
                        let m = Arc::new(RegisterMap::load(&config_dir.join("registerMap.json"))?);
                        shared_map = Some(m.clone());
                        m
                    },
                },
            };

            devices.sort_by(|a, b| a.tank_id.cmp(&b.tank_id));
            let blocks = map.blocks();
            families.push(Family {
                id: *id,
                map,
                blocks,
                devices,
            });
        }

        Ok(FamilySet {
            families,
            enable_map,
            co2,
        })
    }

    /// Persist a new device-enable map atomically, then reload.
    pub fn save_enable_map(&self, map: &HashMap<String, bool>) -> Result<()> {
        let path = self.config_dir.join(ENABLE_FILE);
        write_json_atomic(&path, &serde_json::to_value(map)?)?;
        self.reload();
        Ok(())
    }
}

fn read_devices(path: &Path) -> Result<Vec<Device>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| TankSrvError::config(format!("cannot read {}: {e}", path.display())))?;
    let entries: HashMap<String, DeviceEntry> = serde_json::from_str(&raw)
        .map_err(|e| TankSrvError::config(format!("malformed {}: {e}", path.display())))?;
    Ok(entries
        .into_iter()
        .map(|(tank_id, entry)| entry.into_device(tank_id))
        .collect())
}

fn read_enable_map(path: &Path) -> Result<HashMap<String, bool>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| TankSrvError::config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| TankSrvError::config(format!("malformed {}: {e}", path.display())))
}

fn read_co2(path: &Path) -> Result<Co2Config> {
    if !path.exists() {
        return Ok(Co2Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| TankSrvError::config(format!("cannot read {}: {e}", path.display())))?;
    let co2: Co2Config = serde_json::from_str(&raw)
        .map_err(|e| TankSrvError::config(format!("malformed {}: {e}", path.display())))?;
    co2.validate()?;
    Ok(co2)
}

/// Write JSON via a temp file and rename so readers never see a torn file.
pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    fn basic_map_json() -> &'static str {
        r#"{
            "schema_ver": 1,
            "byte_order": "BE",
            "word_order": "ABCD",
            "blocks": [{"name": "A", "fn": 3, "start": 100, "len": 4}],
            "points": {"ph": {"addr": 100, "type": "u16", "scale": 0.01}}
        }"#
    }

    fn seed_config(dir: &TempDir) {
        write(dir.path(), "registerMap.json", basic_map_json());
        write(dir.path(), "registerMap.bmm.json", basic_map_json());
        write(
            dir.path(),
            "tankConfig.json",
            r#"{"1": "10.0.0.1", "2": {"ip": "10.0.0.2", "unitId": 3}}"#,
        );
        write(dir.path(), "utilityConfig.json", r#"{"u1": "10.0.1.1"}"#);
        write(dir.path(), "bmmConfig.json", r#"{"1": "10.0.2.1"}"#);
        write(dir.path(), "deviceEnable.json", r#"{"1": true, "2": false}"#);
    }

    #[test]
    fn loads_families_and_applies_ctrl_enable_filter() {
        let dir = TempDir::new().unwrap();
        seed_config(&dir);
        let loader = FamilyLoader::new(dir.path(), false).unwrap();
        let set = loader.current();

        let ctrl = set.families.iter().find(|f| f.id == FamilyId::Ctrl).unwrap();
        assert_eq!(ctrl.devices.len(), 1);
        assert_eq!(ctrl.devices[0].tank_id, "1");

        // util and bmm are not filtered by the enable map
        let util = set.families.iter().find(|f| f.id == FamilyId::Util).unwrap();
        assert_eq!(util.devices.len(), 1);
        let bmm = set.families.iter().find(|f| f.id == FamilyId::Bmm).unwrap();
        assert_eq!(bmm.devices.len(), 1);
    }

    #[test]
    fn bmm_filter_is_opt_in() {
        let dir = TempDir::new().unwrap();
        seed_config(&dir);
        // bmm tank "1" is enabled in the map, so it survives the opt-in filter
        let loader = FamilyLoader::new(dir.path(), true).unwrap();
        let set = loader.current();
        assert!(set.families.iter().any(|f| f.id == FamilyId::Bmm));

        // disable it and the family drops out
        write(dir.path(), "deviceEnable.json", r#"{"1": false}"#);
        loader.reload();
        let set = loader.current();
        assert!(!set.families.iter().any(|f| f.id == FamilyId::Bmm));
        assert!(!set.families.iter().any(|f| f.id == FamilyId::Ctrl));
    }

    #[test]
    fn duck_typed_entries_normalize() {
        let dir = TempDir::new().unwrap();
        seed_config(&dir);
        let loader = FamilyLoader::new(dir.path(), false).unwrap();
        let set = loader.current();
        let ctrl = set.families.iter().find(|f| f.id == FamilyId::Ctrl).unwrap();
        let d = &ctrl.devices[0];
        assert_eq!((d.ip.as_str(), d.unit_id, d.port), ("10.0.0.1", 1, 502));
        assert_eq!(d.device_id(FamilyId::Ctrl), "tank-1");
    }

    #[test]
    fn reload_failure_retains_previous_set() {
        let dir = TempDir::new().unwrap();
        seed_config(&dir);
        let loader = FamilyLoader::new(dir.path(), false).unwrap();
        assert_eq!(loader.current().families.len(), 3);

        write(dir.path(), "tankConfig.json", "{not json");
        loader.reload();
        // previous generation still served
        assert_eq!(loader.current().families.len(), 3);
    }

    #[test]
    fn enable_map_save_is_picked_up() {
        let dir = TempDir::new().unwrap();
        seed_config(&dir);
        let loader = FamilyLoader::new(dir.path(), false).unwrap();

        let mut map = HashMap::new();
        map.insert("1".to_string(), true);
        map.insert("2".to_string(), true);
        loader.save_enable_map(&map).unwrap();

        let ctrl_devices = loader
            .current()
            .families
            .iter()
            .find(|f| f.id == FamilyId::Ctrl)
            .unwrap()
            .devices
            .len();
        assert_eq!(ctrl_devices, 2);
    }

    #[test]
    fn co2_config_defaults_and_validates() {
        let dir = TempDir::new().unwrap();
        seed_config(&dir);
        let loader = FamilyLoader::new(dir.path(), false).unwrap();
        assert_eq!(loader.current().co2.default_lpm, 1.0);

        write(
            dir.path(),
            "co2Config.json",
            r#"{"defaultLpm": 0.8, "perTank": {"1": 1.2}}"#,
        );
        loader.reload();
        let co2 = &loader.current().co2;
        assert_eq!(co2.default_lpm, 0.8);
        assert_eq!(co2.per_tank.get("1"), Some(&1.2));

        // invalid dosing rate is a config error: reload keeps previous
        write(dir.path(), "co2Config.json", r#"{"defaultLpm": -2}"#);
        loader.reload();
        assert_eq!(loader.current().co2.default_lpm, 0.8);
    }
}
