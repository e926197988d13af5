//! Connection pool keyed by `(ip, port, unit_id)`

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::Client;
use tokio_modbus::slave::Slave;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TankSrvError};
use crate::family::Device;

/// Identity of one pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub ip: String,
    pub port: u16,
    pub unit_id: u8,
}

impl PoolKey {
    pub fn for_device(device: &Device) -> Self {
        PoolKey {
            ip: device.ip.clone(),
            port: device.port,
            unit_id: device.unit_id,
        }
    }
}

/// One pooled client slot. The context mutex doubles as the per-device
/// serialization point: two callers addressing the same device queue here.
pub struct PoolEntry {
    pub ctx: Mutex<Option<Context>>,
    last_used: std::sync::Mutex<Instant>,
}

impl PoolEntry {
    fn new() -> Self {
        PoolEntry {
            ctx: Mutex::new(None),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        if let Ok(mut guard) = self.last_used.lock() {
            *guard = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|g| g.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

/// Process-wide Modbus connection pool.
pub struct ModbusPool {
    entries: DashMap<PoolKey, Arc<PoolEntry>>,
    connect_timeout: Duration,
    idle_close: Duration,
}

impl ModbusPool {
    pub fn new(connect_timeout: Duration, idle_close: Duration) -> Arc<Self> {
        Arc::new(ModbusPool {
            entries: DashMap::new(),
            connect_timeout,
            idle_close,
        })
    }

    /// Get or create the slot for a device.
    pub fn entry(&self, key: &PoolKey) -> Arc<PoolEntry> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(PoolEntry::new()))
            .clone()
    }

    /// Drop a slot after a socket-level failure so the next request reconnects.
    pub fn poison(&self, key: &PoolKey) {
        if self.entries.remove(key).is_some() {
            debug!(ip = %key.ip, unit = key.unit_id, "poisoned pooled modbus connection");
        }
    }

    /// Open a new client context with the connect timeout applied.
    pub async fn connect(&self, key: &PoolKey) -> Result<Context> {
        let addr: SocketAddr = format!("{}:{}", key.ip, key.port).parse().map_err(|e| {
            TankSrvError::transport(format!("invalid device address {}:{}: {e}", key.ip, key.port))
        })?;
        match timeout(self.connect_timeout, tcp::connect_slave(addr, Slave(key.unit_id))).await {
            Ok(Ok(ctx)) => {
                debug!(%addr, unit = key.unit_id, "modbus connection established");
                Ok(ctx)
            },
            Ok(Err(e)) => Err(TankSrvError::transport(format!(
                "connect to {addr} failed: {e}"
            ))),
            Err(_) => Err(TankSrvError::timeout(format!(
                "connect to {addr} timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    /// Background sweep closing connections unused for `idle_close`.
    pub fn start_idle_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let period = pool.idle_close.max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pool.sweep_idle().await,
                }
            }
        })
    }

    async fn sweep_idle(&self) {
        let stale: Vec<(PoolKey, Arc<PoolEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.value().idle_for() >= self.idle_close)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, entry) in stale {
            // Entries mid-request hold the ctx lock; skip them and retry next sweep.
            if let Ok(mut guard) = entry.ctx.try_lock() {
                if let Some(mut ctx) = guard.take() {
                    if let Err(e) = ctx.disconnect().await {
                        warn!(ip = %key.ip, "error closing idle modbus connection: {e}");
                    }
                }
                self.entries.remove(&key);
                debug!(ip = %key.ip, unit = key.unit_id, "closed idle modbus connection");
            }
        }
    }

    /// Close every pooled connection; used during shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<PoolEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        self.entries.clear();
        for entry in all {
            let mut guard = entry.ctx.lock().await;
            if let Some(mut ctx) = guard.take() {
                let _ = ctx.disconnect().await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ip: &str, unit: u8) -> PoolKey {
        PoolKey {
            ip: ip.to_string(),
            port: 502,
            unit_id: unit,
        }
    }

    #[tokio::test]
    async fn entries_are_shared_per_key() {
        let pool = ModbusPool::new(Duration::from_millis(100), Duration::from_secs(60));
        let a = pool.entry(&key("10.0.0.1", 1));
        let b = pool.entry(&key("10.0.0.1", 1));
        assert!(Arc::ptr_eq(&a, &b));
        let c = pool.entry(&key("10.0.0.1", 2));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn poison_removes_the_slot() {
        let pool = ModbusPool::new(Duration::from_millis(100), Duration::from_secs(60));
        let k = key("10.0.0.9", 1);
        let first = pool.entry(&k);
        pool.poison(&k);
        let second = pool.entry(&k);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn connect_times_out_against_blackhole() {
        // RFC 5737 TEST-NET address: connects hang rather than refuse.
        let pool = ModbusPool::new(Duration::from_millis(50), Duration::from_secs(60));
        let err = pool.connect(&key("192.0.2.1", 1)).await.unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("timed out") || msg.contains("failed"),
            "unexpected error: {msg}"
        );
    }

    #[tokio::test]
    async fn rejects_unparseable_address() {
        let pool = ModbusPool::new(Duration::from_millis(50), Duration::from_secs(60));
        let err = pool.connect(&key("not an ip", 1)).await.unwrap_err();
        assert!(err.to_string().contains("invalid device address"));
    }
}
