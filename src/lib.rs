//! # Tank Gateway Service (TankSrv)
//!
//! Edge gateway for aquaculture sites: polls a fleet of Modbus TCP devices
//! grouped into families (tank controllers, utility controllers, biomass
//! monitors), decodes their holding registers into named telemetry points,
//! publishes each frame to the MQTT broker, appends rate-limited NDJSON logs,
//! evaluates alarm rules and serves a small HTTP read/control API.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ Family Loader │──►│    Poller    │──►│ Modbus Transport │
//! │ (config scan) │   │ (worker pool)│   │  (pooled TCP)    │
//! └───────────────┘   └──────┬───────┘   └──────────────────┘
//!                            │ frames
//!          ┌─────────┬───────┼──────────┬───────────┐
//!          ▼         ▼       ▼          ▼           ▼
//!     Live Cache  Publisher  Log     Alarm       HTTP API
//!                 (MQTT)    Writer   Engine      (axum)
//! ```
//!
//! One tick polls every `(family, device)` pair through a bounded worker
//! pool; each frame flows to the cache, broker, log and alarm engine in that
//! order, and the alarm batch flushes once at tick end.

pub mod alarm;
pub mod api;
pub mod config;
pub mod error;
pub mod family;
pub mod frame;
pub mod live_cache;
pub mod log_writer;
pub mod modbus;
pub mod poller;
pub mod publisher;
pub mod register_map;

pub use config::Config;
pub use error::{Result, TankSrvError};

use tracing::error;

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
