//! Modbus TCP transport: pooled persistent connections and block reads
//!
//! The pool keeps one client context per `(ip, port, unit_id)`; workers
//! addressing the same device serialize on that entry's lock, so requests to
//! one socket never interleave. Socket-level failures poison the pooled entry
//! and the next request reconnects.

mod client;
mod pool;

pub use client::ModbusTransport;
pub use pool::{ModbusPool, PoolKey};

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::family::Device;
use crate::register_map::Block;

/// Read seam between the poller and the wire.
///
/// The production implementation is [`ModbusTransport`]; tests poll against a
/// mock.
#[async_trait]
pub trait BlockReader: Send + Sync {
    /// Read every declared block for a device, in declared order.
    ///
    /// Returns `block name -> byte buffer` with exactly `len * 2` bytes per
    /// block, or the last transport error once retries are exhausted.
    async fn read_blocks_for_device(
        &self,
        device: &Device,
        blocks: &[Block],
    ) -> Result<HashMap<String, Vec<u8>>>;
}
