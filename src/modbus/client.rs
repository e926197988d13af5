//! Block reads and register writes over pooled connections, with retries

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::{Context, Reader, Writer};
use tracing::{debug, warn};

use super::pool::{ModbusPool, PoolKey};
use super::BlockReader;
use crate::error::{Result, TankSrvError};
use crate::family::Device;
use crate::register_map::Block;

/// One wire operation, retried as a unit.
enum Request<'v> {
    ReadHolding { start: u16, len: u16 },
    WriteSingle { addr: u16, value: u16 },
    WriteMultiple { addr: u16, values: &'v [u16] },
}

/// Retry-aware Modbus client over the shared pool.
pub struct ModbusTransport {
    pool: Arc<ModbusPool>,
    request_timeout: Duration,
    max_retries: u32,
}

/// Backoff before retry attempt `attempt` (0-based).
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(150 + u64::from(attempt) * 200)
}

impl ModbusTransport {
    pub fn new(pool: Arc<ModbusPool>, request_timeout: Duration, max_retries: u32) -> Self {
        Self {
            pool,
            request_timeout,
            max_retries,
        }
    }

    /// Write registers on a device: FC6 for one register, FC16 for several.
    /// Unknown function codes fail immediately, without touching the wire.
    pub async fn write_registers(
        &self,
        device: &Device,
        fc: u8,
        start: u16,
        values: &[u16],
    ) -> Result<()> {
        let request = match fc {
            6 => {
                if values.len() != 1 {
                    return Err(TankSrvError::write_plan(format!(
                        "FC6 writes exactly one register, got {}",
                        values.len()
                    )));
                }
                Request::WriteSingle {
                    addr: start,
                    value: values[0],
                }
            },
            16 => {
                if values.is_empty() {
                    return Err(TankSrvError::write_plan(
                        "FC16 requires at least one register".to_string(),
                    ));
                }
                Request::WriteMultiple {
                    addr: start,
                    values,
                }
            },
            other => {
                return Err(TankSrvError::write_plan(format!(
                    "unsupported write function code {other}"
                )))
            },
        };

        let key = PoolKey::for_device(device);
        let entry = self.pool.entry(&key);
        let mut ctx = entry.ctx.lock().await;
        let result = self.execute_with_retry(&key, &mut ctx, &request).await;
        entry.touch();
        if result.is_err() {
            self.pool.poison(&key);
        }
        result.map(|_| ())
    }

    /// Run one request with the retry policy: up to `max_retries + 1`
    /// attempts, reconnecting after any failure, since the connection state
    /// after an error is unknown.
    async fn execute_with_retry(
        &self,
        key: &PoolKey,
        ctx: &mut Option<Context>,
        request: &Request<'_>,
    ) -> Result<Vec<u16>> {
        let attempts = self.max_retries + 1;
        let mut last_err = TankSrvError::transport("no attempts made".to_string());

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            if ctx.is_none() {
                match self.pool.connect(key).await {
                    Ok(connected) => *ctx = Some(connected),
                    Err(e) => {
                        warn!(ip = %key.ip, attempt, "modbus connect failed: {e}");
                        last_err = e;
                        continue;
                    },
                }
            }
            let Some(client) = ctx.as_mut() else {
                continue;
            };

            match timeout(self.request_timeout, Self::execute(client, request)).await {
                Ok(Ok(words)) => return Ok(words),
                Ok(Err(e)) => {
                    warn!(ip = %key.ip, attempt, "modbus request failed: {e}");
                    last_err = e;
                },
                Err(_) => {
                    last_err = TankSrvError::timeout(format!(
                        "request to {} timed out after {:?}",
                        key.ip, self.request_timeout
                    ));
                    warn!(ip = %key.ip, attempt, "modbus request timed out");
                },
            }
            *ctx = None;
        }

        Err(last_err)
    }

    async fn execute(client: &mut Context, request: &Request<'_>) -> Result<Vec<u16>> {
        match request {
            Request::ReadHolding { start, len } => {
                match client.read_holding_registers(*start, *len).await {
                    Ok(Ok(words)) => Ok(words),
                    Ok(Err(exc)) => Err(TankSrvError::transport(format!(
                        "read @{start}+{len} rejected: {exc:?}"
                    ))),
                    Err(e) => Err(TankSrvError::transport(format!(
                        "read @{start}+{len} failed: {e}"
                    ))),
                }
            },
            Request::WriteSingle { addr, value } => {
                match client.write_single_register(*addr, *value).await {
                    Ok(Ok(())) => Ok(Vec::new()),
                    Ok(Err(exc)) => Err(TankSrvError::transport(format!(
                        "write FC6 @{addr} rejected: {exc:?}"
                    ))),
                    Err(e) => Err(TankSrvError::transport(format!(
                        "write FC6 @{addr} failed: {e}"
                    ))),
                }
            },
            Request::WriteMultiple { addr, values } => {
                match client.write_multiple_registers(*addr, values).await {
                    Ok(Ok(())) => Ok(Vec::new()),
                    Ok(Err(exc)) => Err(TankSrvError::transport(format!(
                        "write FC16 @{addr} rejected: {exc:?}"
                    ))),
                    Err(e) => Err(TankSrvError::transport(format!(
                        "write FC16 @{addr} failed: {e}"
                    ))),
                }
            },
        }
    }
}

#[async_trait]
impl BlockReader for ModbusTransport {
    async fn read_blocks_for_device(
        &self,
        device: &Device,
        blocks: &[Block],
    ) -> Result<HashMap<String, Vec<u8>>> {
        let key = PoolKey::for_device(device);
        let entry = self.pool.entry(&key);
        let mut ctx = entry.ctx.lock().await;

        let mut buffers = HashMap::with_capacity(blocks.len());
        for block in blocks {
            if block.fn_code != 3 {
                return Err(TankSrvError::internal(format!(
                    "block '{}' declares fn={}, block reads are FC3 only",
                    block.name, block.fn_code
                )));
            }
            let request = Request::ReadHolding {
                start: block.start,
                len: block.len,
            };
            match self.execute_with_retry(&key, &mut ctx, &request).await {
                Ok(words) => {
                    debug!(ip = %device.ip, block = %block.name, regs = words.len(), "block read ok");
                    buffers.insert(block.name.clone(), words_to_bytes(&words));
                },
                Err(e) => {
                    entry.touch();
                    self.pool.poison(&key);
                    return Err(e);
                },
            }
        }
        entry.touch();
        Ok(buffers)
    }
}

/// Registers serialize big-endian into the block buffer, matching the wire.
fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for w in words {
        bytes.extend_from_slice(&w.to_be_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Device {
        Device {
            tank_id: "1".to_string(),
            ip: "192.0.2.1".to_string(),
            unit_id: 1,
            port: 502,
        }
    }

    #[test]
    fn backoff_is_linear_from_150ms() {
        assert_eq!(backoff_delay(0), Duration::from_millis(150));
        assert_eq!(backoff_delay(1), Duration::from_millis(350));
        assert_eq!(backoff_delay(2), Duration::from_millis(550));
    }

    #[test]
    fn words_serialize_big_endian() {
        assert_eq!(words_to_bytes(&[0x02E4, 0x0001]), vec![0x02, 0xE4, 0x00, 0x01]);
        assert_eq!(words_to_bytes(&[]), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn unknown_write_fc_fails_without_io() {
        let pool = ModbusPool::new(Duration::from_millis(50), Duration::from_secs(60));
        let transport = ModbusTransport::new(pool.clone(), Duration::from_millis(50), 0);
        let err = transport
            .write_registers(&test_device(), 5, 0, &[1])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported write function code"));
        // nothing touched the pool
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn write_fc_argument_counts_are_enforced() {
        let pool = ModbusPool::new(Duration::from_millis(50), Duration::from_secs(60));
        let transport = ModbusTransport::new(pool, Duration::from_millis(50), 0);
        assert!(transport
            .write_registers(&test_device(), 6, 0, &[1, 2])
            .await
            .is_err());
        assert!(transport
            .write_registers(&test_device(), 16, 0, &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn non_fc3_block_is_an_internal_error() {
        let pool = ModbusPool::new(Duration::from_millis(50), Duration::from_secs(60));
        let transport = ModbusTransport::new(pool, Duration::from_millis(50), 0);
        let blocks = vec![Block {
            name: "X".to_string(),
            fn_code: 4,
            start: 0,
            len: 2,
        }];
        let err = transport
            .read_blocks_for_device(&test_device(), &blocks)
            .await
            .unwrap_err();
        assert!(matches!(err, TankSrvError::InternalError(_)));
    }
}
