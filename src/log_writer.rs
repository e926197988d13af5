//! Rate-limited NDJSON telemetry log
//!
//! One file per `(family, site, tank, day)` with the day boundary at HST
//! (UTC-10). Producers enqueue rows over a bounded channel; a single consumer
//! task owns the rate-limit state and the open files, so rows from concurrent
//! workers never interleave within a file. The same module owns the read side
//! used by the API: time-range queries over the daily files and the sanitized
//! download path resolution.

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::{Result, TankSrvError};
use crate::family::FamilyId;
use crate::frame::TelemetryFrame;

/// Hawaii standard time: fixed UTC-10, no DST.
fn hst() -> FixedOffset {
    FixedOffset::west_opt(10 * 3600).expect("HST offset is in range")
}

/// Point names logged as integers; these model monotonic counters where
/// sub-unit precision is noise.
const INTEGER_POINTS: &[&str] = &["counter_value", "timer_seconds"];

#[derive(Clone, Debug)]
pub struct LogWriterConfig {
    pub log_dir: PathBuf,
    pub config_dir: PathBuf,
    pub site_id: String,
    pub min_interval: Duration,
    pub queue_depth: usize,
}

/// Counters exposed on the health endpoint.
#[derive(Default)]
pub struct LogWriterStats {
    pub rows_written: AtomicU64,
    pub rows_dropped: AtomicU64,
    pub write_errors: AtomicU64,
}

enum Command {
    Row(FamilyId, TelemetryFrame),
    Shutdown(oneshot::Sender<()>),
}

/// Producer handle; clone freely across workers.
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::Sender<Command>,
    stats: Arc<LogWriterStats>,
}

impl LogWriter {
    /// Spawn the consumer task and return the producer handle.
    pub fn start(config: LogWriterConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let stats = Arc::new(LogWriterStats::default());
        let consumer = Consumer::new(config, stats.clone());
        tokio::spawn(consumer.run(rx));
        Ok(LogWriter { tx, stats })
    }

    /// Enqueue one frame for logging. Awaits when the queue is full, which is
    /// the backpressure the producers honor.
    pub async fn enqueue(&self, family: FamilyId, frame: TelemetryFrame) {
        if self.tx.send(Command::Row(family, frame)).await.is_err() {
            warn!("log writer queue is closed, row discarded");
        }
    }

    /// Drain the queue, flush and close every stream, then return.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        info!(
            rows = self.stats.rows_written.load(Ordering::Relaxed),
            dropped = self.stats.rows_dropped.load(Ordering::Relaxed),
            "log writer drained"
        );
    }

    pub fn stats(&self) -> &LogWriterStats {
        &self.stats
    }
}

struct OpenStream {
    path: PathBuf,
    file: File,
}

struct Consumer {
    config: LogWriterConfig,
    stats: Arc<LogWriterStats>,
    last_write: HashMap<(FamilyId, String), Instant>,
    whitelists: HashMap<FamilyId, Option<Vec<String>>>,
    /// Current stream per (family, tank); rotation closes the old one.
    streams: HashMap<(FamilyId, String), OpenStream>,
}

impl Consumer {
    fn new(config: LogWriterConfig, stats: Arc<LogWriterStats>) -> Self {
        Consumer {
            config,
            stats,
            last_write: HashMap::new(),
            whitelists: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Row(family, frame) => self.handle_row(family, &frame),
                Command::Shutdown(ack) => {
                    // Everything enqueued before the shutdown command has
                    // already been handled: the channel is FIFO.
                    self.close_all();
                    let _ = ack.send(());
                    return;
                },
            }
        }
        self.close_all();
    }

    fn handle_row(&mut self, family: FamilyId, frame: &TelemetryFrame) {
        let stream_key = (family, frame.tank_id.clone());
        if let Some(last) = self.last_write.get(&stream_key) {
            if last.elapsed() < self.config.min_interval {
                self.stats.rows_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let row = self.build_row(family, frame);
        let hst_now = frame.ts_utc.with_timezone(&hst());
        let file_name = format!(
            "telemetry-{}-{}-{}-{}.ndjson",
            family,
            self.config.site_id,
            frame.tank_id,
            hst_now.format("%Y-%m-%d")
        );
        let path = self.config.log_dir.join(file_name);

        match self.append_line(&stream_key, &path, &row) {
            Ok(()) => {
                self.last_write.insert(stream_key, Instant::now());
                self.stats.rows_written.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                // Stream errors never stop the writer; the next row retries.
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                error!(tank = %frame.tank_id, "log write failed: {e}");
            },
        }
    }

    fn build_row(&mut self, family: FamilyId, frame: &TelemetryFrame) -> Value {
        let ts_hst = frame.ts_utc.with_timezone(&hst()).to_rfc3339();
        let mut row = Map::new();
        row.insert("ts_hst".to_string(), json!(ts_hst));
        row.insert("tank_id".to_string(), json!(frame.tank_id));

        let whitelist = self.whitelist_for(family);
        for (name, value) in &frame.s {
            let allowed = match &whitelist {
                Some(list) => list.iter().any(|p| p == name),
                None => true,
            };
            if !allowed {
                continue;
            }
            let rendered = if INTEGER_POINTS.contains(&name.as_str()) {
                json!(value.trunc() as i64)
            } else {
                json!((value * 10.0).round() / 10.0)
            };
            row.insert(name.clone(), rendered);
        }
        Value::Object(row)
    }

    /// `logPoints.<family>.json` if present, else `logPoints.json`; cached
    /// after the first lookup. No whitelist file means every point is logged.
    fn whitelist_for(&mut self, family: FamilyId) -> Option<Vec<String>> {
        if let Some(cached) = self.whitelists.get(&family) {
            return cached.clone();
        }
        let candidates = [
            self.config.config_dir.join(format!("logPoints.{family}.json")),
            self.config.config_dir.join("logPoints.json"),
        ];
        let mut loaded = None;
        for path in &candidates {
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(path)
                .map_err(TankSrvError::from)
                .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).map_err(TankSrvError::from))
            {
                Ok(points) => {
                    loaded = Some(points);
                    break;
                },
                Err(e) => warn!("ignoring malformed whitelist {}: {e}", path.display()),
            }
        }
        if loaded.is_none() {
            warn!(family = %family, "no log whitelist found, logging all points");
        }
        self.whitelists.insert(family, loaded.clone());
        loaded
    }

    fn append_line(
        &mut self,
        stream_key: &(FamilyId, String),
        path: &Path,
        row: &Value,
    ) -> Result<()> {
        let rotated = self
            .streams
            .get(stream_key)
            .map(|s| s.path != *path)
            .unwrap_or(true);
        if rotated {
            if let Some(old) = self.streams.remove(stream_key) {
                drop(old); // closes the previous day's file
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.streams.insert(
                stream_key.clone(),
                OpenStream {
                    path: path.to_path_buf(),
                    file,
                },
            );
        }
        let stream = self
            .streams
            .get_mut(stream_key)
            .ok_or_else(|| TankSrvError::LogWriterError("stream vanished".to_string()))?;
        let line = serde_json::to_string(row)?;
        stream.file.write_all(line.as_bytes())?;
        stream.file.write_all(b"\n")?;
        stream.file.flush()?;
        Ok(())
    }

    fn close_all(&mut self) {
        for (_, stream) in self.streams.drain() {
            if let Err(e) = (&stream.file).flush() {
                warn!("error flushing {} on close: {e}", stream.path.display());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Read side: range queries and download resolution over the daily files
// ---------------------------------------------------------------------------

/// One sample from the on-disk log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SeriesPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Timestamp keys accepted on read, tried in order.
const TS_KEYS: &[&str] = &["ts_utc", "ts_hst", "ts", "ts_local", "time"];

fn row_timestamp(row: &Value) -> Option<DateTime<Utc>> {
    for key in TS_KEYS {
        if let Some(raw) = row.get(*key).and_then(Value::as_str) {
            if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
                return Some(ts.with_timezone(&Utc));
            }
        }
    }
    None
}

/// Scan the daily files of one tank for a field over a time range.
///
/// Matches files named `telemetry-*-<tank>-*.ndjson` (optionally narrowed to
/// one family), collects `{ts, value}` pairs inside `[start, end]` and
/// returns them sorted ascending by timestamp.
pub fn query_series(
    log_dir: &Path,
    tank_id: &str,
    family: Option<&str>,
    field: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<SeriesPoint>> {
    let mut points = Vec::new();
    let needle = format!("-{tank_id}-");
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(points), // no log dir yet: empty series
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("telemetry-") || !name.ends_with(".ndjson") {
            continue;
        }
        if !name.contains(&needle) {
            continue;
        }
        if let Some(family) = family {
            if !name.starts_with(&format!("telemetry-{family}-")) {
                continue;
            }
        }

        let file = File::open(entry.path())?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue, // tolerate torn or foreign lines
            };
            // The filename match is loose (dates also contain hyphens), so
            // confirm the row really belongs to this tank when it says so.
            if let Some(row_tank) = row.get("tank_id").and_then(Value::as_str) {
                if row_tank != tank_id {
                    continue;
                }
            }
            let Some(ts) = row_timestamp(&row) else {
                continue;
            };
            if ts < start || ts > end {
                continue;
            }
            if let Some(value) = row.get(field).and_then(Value::as_f64) {
                points.push(SeriesPoint { ts, value });
            }
        }
    }

    points.sort_by_key(|p| p.ts);
    Ok(points)
}

/// Names of all log files, sorted.
pub fn list_log_files(log_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(names),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".ndjson") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Resolve a requested download to a real file strictly inside the log dir.
///
/// Rejects anything that is not a bare basename and anything whose resolved
/// path escapes the directory.
pub fn resolve_log_file(log_dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    let is_bare = candidate.file_name().map(|f| f == candidate.as_os_str()).unwrap_or(false);
    if !is_bare || name.starts_with('.') {
        return Err(TankSrvError::invalid_parameter(format!(
            "invalid log file name '{name}'"
        )));
    }
    let path = log_dir.join(name);
    if !path.is_file() {
        return Err(TankSrvError::NotFound(format!("log file '{name}'")));
    }
    let canonical = path
        .canonicalize()
        .map_err(|e| TankSrvError::invalid_parameter(format!("cannot resolve '{name}': {e}")))?;
    let root = log_dir
        .canonicalize()
        .map_err(|e| TankSrvError::invalid_parameter(format!("cannot resolve log dir: {e}")))?;
    if !canonical.starts_with(&root) {
        return Err(TankSrvError::invalid_parameter(format!(
            "log file '{name}' escapes the log directory"
        )));
    }
    Ok(canonical)
}
