//! Poll scheduler: one tick over every (family, device) pair
//!
//! A single driver loop fires ticks at the configured cadence. Each tick
//! flattens the current families into a work list and runs a bounded worker
//! pool over it; workers draw indices from a shared atomic counter, so a
//! device is polled by exactly one worker per tick. Overlapping ticks are
//! impossible: the driver awaits the tick before looking at the clock again,
//! and missed cadence points are skipped.

use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::AlarmEngine;
use crate::family::{Family, FamilyId, FamilyLoader, FamilySet};
use crate::frame::TelemetryFrame;
use crate::live_cache::LiveCache;
use crate::log_writer::LogWriter;
use crate::modbus::BlockReader;
use crate::publisher::FramePublisher;

/// Rolling counters for the health surface.
#[derive(Default)]
pub struct PollStats {
    pub ticks: AtomicU64,
    pub last_ok: AtomicU64,
    pub last_fail: AtomicU64,
    pub last_duration_ms: AtomicU64,
}

/// Everything a poll worker needs, bundled once instead of cloning six Arcs.
pub struct PollContext {
    pub loader: Arc<FamilyLoader>,
    pub reader: Arc<dyn BlockReader>,
    pub cache: Arc<LiveCache>,
    pub publisher: Arc<dyn FramePublisher>,
    pub log_writer: LogWriter,
    pub alarms: Arc<AlarmEngine>,
    pub stats: Arc<PollStats>,
    pub site_id: String,
}

pub struct Poller {
    ctx: Arc<PollContext>,
    poll_interval: Duration,
    reload_interval: Duration,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        ctx: Arc<PollContext>,
        poll_interval: Duration,
        reload_interval: Duration,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Poller {
            ctx,
            poll_interval,
            reload_interval,
            concurrency,
            cancel,
        }
    }

    /// Drive ticks until cancelled. The in-flight tick always completes.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_reload = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("poller stopping, no further ticks scheduled");
                    return;
                },
                _ = ticker.tick() => {
                    if last_reload.elapsed() >= self.reload_interval {
                        self.ctx.loader.reload();
                        last_reload = Instant::now();
                    }
                    self.run_tick().await;
                },
            }
        }
    }

    /// Execute one tick to completion, then flush the alarm batch.
    pub async fn run_tick(&self) {
        let started = Instant::now();
        let set = self.ctx.loader.current();
        seed_utility_entries(&self.ctx.cache, &set);

        let work: Arc<Vec<(usize, usize)>> = Arc::new(
            set.families
                .iter()
                .enumerate()
                .flat_map(|(fi, family)| (0..family.devices.len()).map(move |di| (fi, di)))
                .collect(),
        );
        if work.is_empty() {
            debug!("tick skipped, no pollable devices");
            return;
        }

        let workers = self.concurrency.min(work.len());
        let index = Arc::new(AtomicUsize::new(0));
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let ctx = self.ctx.clone();
            let set = set.clone();
            let work = work.clone();
            let index = index.clone();
            pool.spawn(async move { worker_loop(ctx, set, work, index).await });
        }

        let mut ok = 0u64;
        let mut fail = 0u64;
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((worker_ok, worker_fail)) => {
                    ok += worker_ok;
                    fail += worker_fail;
                },
                Err(e) => warn!("poll worker panicked: {e}"),
            }
        }

        // The batch flush runs once per tick, after every worker has drained.
        self.ctx.alarms.flush().await;

        let elapsed = started.elapsed();
        let stats = &self.ctx.stats;
        stats.ticks.fetch_add(1, Ordering::Relaxed);
        stats.last_ok.store(ok, Ordering::Relaxed);
        stats.last_fail.store(fail, Ordering::Relaxed);
        stats
            .last_duration_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        info!(
            devices = work.len(),
            ok,
            fail,
            duration_ms = elapsed.as_millis() as u64,
            "tick complete"
        );
    }
}

/// Pre-seed utility entries so the API is stable before their first poll.
fn seed_utility_entries(cache: &LiveCache, set: &FamilySet) {
    for family in set.families.iter().filter(|f| f.id == FamilyId::Util) {
        for device in &family.devices {
            cache.seed(&device.tank_id, family.id, &device.ip);
        }
    }
}

async fn worker_loop(
    ctx: Arc<PollContext>,
    set: Arc<FamilySet>,
    work: Arc<Vec<(usize, usize)>>,
    index: Arc<AtomicUsize>,
) -> (u64, u64) {
    let mut ok = 0u64;
    let mut fail = 0u64;
    loop {
        let i = index.fetch_add(1, Ordering::SeqCst);
        if i >= work.len() {
            break;
        }
        // Roughly every third item gets a small jitter so co-located radios
        // do not burst in lockstep.
        if i % 3 == 2 {
            let jitter_ms = rand::thread_rng().gen_range(0..200u64);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }
        let (fi, di) = work[i];
        let family = &set.families[fi];
        if poll_device(&ctx, family, di).await {
            ok += 1;
        } else {
            fail += 1;
        }
    }
    (ok, fail)
}

/// Poll one device and fan the frame out: cache, publisher, log, alarms.
async fn poll_device(ctx: &PollContext, family: &Family, device_index: usize) -> bool {
    let device = &family.devices[device_index];
    let device_id = device.device_id(family.id);
    let ts_utc = Utc::now();

    let frame = match ctx
        .reader
        .read_blocks_for_device(device, &family.blocks)
        .await
    {
        Ok(buffers) => {
            let values = family.map.decode_points_from_blocks(&buffers);
            TelemetryFrame::ok(
                &ctx.site_id,
                &device.tank_id,
                &device_id,
                family.map.schema_ver,
                values,
                ts_utc,
            )
        },
        Err(e) => {
            warn!(tank = %device.tank_id, ip = %device.ip, "poll failed: {e}");
            TelemetryFrame::fail(
                &ctx.site_id,
                &device.tank_id,
                &device_id,
                family.map.schema_ver,
                e.to_string(),
                ts_utc,
            )
        },
    };

    ctx.cache.update(&device.tank_id, family.id, &device.ip, &frame);
    if let Err(e) = ctx.publisher.publish_frame(&frame).await {
        warn!(tank = %device.tank_id, "publish failed: {e}");
    }
    ctx.log_writer.enqueue(family.id, frame.clone()).await;
    ctx.alarms.evaluate_frame(family.id, &device.tank_id, &frame, frame.ts_utc);

    frame.is_ok()
}
