//! Service configuration
//!
//! Configuration is assembled from defaults, environment variables and command
//! line flags, in that order. Every knob the poller, transport, log writer and
//! alarm engine honor lives here so the rest of the service never touches the
//! environment directly.

use clap::Parser;
use std::path::PathBuf;

use crate::error::{Result, TankSrvError};

/// Runtime configuration for the gateway
#[derive(Clone, Debug)]
pub struct Config {
    /// Site identifier used in topics, frames and log file names
    pub site_id: String,
    /// Directory scanned for family/device/map JSON files
    pub config_dir: PathBuf,

    // MQTT broker
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_tls: bool,
    /// Topic namespace prefix, first segment of every published topic
    pub mqtt_namespace: String,
    pub mqtt_qos: u8,

    // Polling
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    pub reload_interval_ms: u64,

    // Transport timeouts and retry policy
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub idle_close_ms: u64,
    pub max_retries: u32,

    // HTTP API
    pub api_host: String,
    pub api_port: u16,
    pub disable_hsts: bool,

    // Telemetry log writer
    pub log_dir: PathBuf,
    pub log_min_interval_ms: u64,

    // Alarms
    pub connectivity_alarm_min: u64,
    pub webhook_url: Option<String>,

    /// Extend the device-enable filter from ctrl to the bmm family
    pub bmm_enable_filter: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            site_id: "site1".to_string(),
            config_dir: PathBuf::from("./config"),

            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_tls: false,
            mqtt_namespace: "tanks".to_string(),
            mqtt_qos: 1,

            poll_interval_ms: 60_000,
            concurrency: 8,
            reload_interval_ms: 300_000,

            connect_timeout_ms: 2_500,
            request_timeout_ms: 1_500,
            idle_close_ms: 60_000,
            max_retries: 2,

            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            disable_hsts: false,

            log_dir: PathBuf::from("./logs"),
            log_min_interval_ms: 30_000,

            connectivity_alarm_min: 60,
            webhook_url: None,

            bmm_enable_filter: false,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Aquaculture site gateway", long_about = None)]
pub struct Args {
    #[arg(long, env = "TANKSRV_SITE_ID", help = "Site identifier")]
    site_id: Option<String>,

    #[arg(long, env = "TANKSRV_CONFIG_DIR", help = "Configuration directory")]
    config_dir: Option<PathBuf>,

    #[arg(long, env = "TANKSRV_MQTT_HOST", help = "MQTT broker host")]
    mqtt_host: Option<String>,

    #[arg(long, env = "TANKSRV_MQTT_PORT", help = "MQTT broker port")]
    mqtt_port: Option<u16>,

    #[arg(long, env = "TANKSRV_MQTT_USERNAME", help = "MQTT username")]
    mqtt_username: Option<String>,

    #[arg(long, env = "TANKSRV_MQTT_PASSWORD", help = "MQTT password")]
    mqtt_password: Option<String>,

    #[arg(long, env = "TANKSRV_MQTT_TLS", help = "Enable MQTT TLS")]
    mqtt_tls: Option<bool>,

    #[arg(long, env = "TANKSRV_MQTT_NAMESPACE", help = "Topic namespace prefix")]
    mqtt_namespace: Option<String>,

    #[arg(long, env = "TANKSRV_MQTT_QOS", help = "Publish QoS level (0-2)")]
    mqtt_qos: Option<u8>,

    #[arg(long, env = "TANKSRV_POLL_INTERVAL_MS", help = "Poll cadence in milliseconds")]
    poll_interval_ms: Option<u64>,

    #[arg(long, env = "TANKSRV_CONCURRENCY", help = "Poll worker concurrency")]
    concurrency: Option<usize>,

    #[arg(long, env = "TANKSRV_RELOAD_INTERVAL_MS", help = "Family reload period in milliseconds")]
    reload_interval_ms: Option<u64>,

    #[arg(long, env = "TANKSRV_API_HOST", help = "HTTP API bind host")]
    api_host: Option<String>,

    #[arg(long, env = "TANKSRV_API_PORT", help = "HTTP API bind port")]
    api_port: Option<u16>,

    #[arg(long, env = "TANKSRV_DISABLE_HSTS", help = "Do not emit the HSTS header")]
    disable_hsts: Option<bool>,

    #[arg(long, env = "TANKSRV_LOG_DIR", help = "Telemetry log directory")]
    log_dir: Option<PathBuf>,

    #[arg(long, env = "TANKSRV_LOG_MIN_INTERVAL_MS", help = "Minimum milliseconds between log rows per tank")]
    log_min_interval_ms: Option<u64>,

    #[arg(long, env = "TANKSRV_CONNECTIVITY_ALARM_MIN", help = "Offline minutes before a connectivity alarm")]
    connectivity_alarm_min: Option<u64>,

    #[arg(long, env = "TANKSRV_WEBHOOK_URL", help = "Alarm notification webhook URL")]
    webhook_url: Option<String>,

    #[arg(long, env = "TANKSRV_BMM_ENABLE_FILTER", help = "Apply the device-enable filter to the bmm family")]
    bmm_enable_filter: Option<bool>,
}

impl Config {
    /// Build the configuration from defaults, environment and CLI arguments.
    pub fn from_args() -> Result<Self> {
        Self::from_parsed(Args::parse())
    }

    fn from_parsed(args: Args) -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = args.site_id {
            config.site_id = v;
        }
        if let Some(v) = args.config_dir {
            config.config_dir = v;
        }
        if let Some(v) = args.mqtt_host {
            config.mqtt_host = v;
        }
        if let Some(v) = args.mqtt_port {
            config.mqtt_port = v;
        }
        if args.mqtt_username.is_some() {
            config.mqtt_username = args.mqtt_username;
        }
        if args.mqtt_password.is_some() {
            config.mqtt_password = args.mqtt_password;
        }
        if let Some(v) = args.mqtt_tls {
            config.mqtt_tls = v;
        }
        if let Some(v) = args.mqtt_namespace {
            config.mqtt_namespace = v;
        }
        if let Some(v) = args.mqtt_qos {
            config.mqtt_qos = v;
        }
        if let Some(v) = args.poll_interval_ms {
            config.poll_interval_ms = v;
        }
        if let Some(v) = args.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = args.reload_interval_ms {
            config.reload_interval_ms = v;
        }
        if let Some(v) = args.api_host {
            config.api_host = v;
        }
        if let Some(v) = args.api_port {
            config.api_port = v;
        }
        if let Some(v) = args.disable_hsts {
            config.disable_hsts = v;
        }
        if let Some(v) = args.log_dir {
            config.log_dir = v;
        }
        if let Some(v) = args.log_min_interval_ms {
            config.log_min_interval_ms = v;
        }
        if let Some(v) = args.connectivity_alarm_min {
            config.connectivity_alarm_min = v;
        }
        if args.webhook_url.is_some() {
            config.webhook_url = args.webhook_url;
        }
        if let Some(v) = args.bmm_enable_filter {
            config.bmm_enable_filter = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.site_id.is_empty() {
            return Err(TankSrvError::config("site_id must not be empty"));
        }
        if self.mqtt_qos > 2 {
            return Err(TankSrvError::config(format!(
                "mqtt_qos must be 0-2, got {}",
                self.mqtt_qos
            )));
        }
        if self.concurrency == 0 {
            return Err(TankSrvError::config("concurrency must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(TankSrvError::config("poll_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Connectivity alarm threshold in milliseconds.
    pub fn connectivity_alarm_ms(&self) -> i64 {
        (self.connectivity_alarm_min * 60_000) as i64
    }
}
