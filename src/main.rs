use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tanksrv::alarm::{AlarmEngine, AlarmNotifier, WebhookNotifier};
use tanksrv::api::{self, ApiState};
use tanksrv::config::Config;
use tanksrv::family::FamilyLoader;
use tanksrv::live_cache::LiveCache;
use tanksrv::log_writer::{LogWriter, LogWriterConfig};
use tanksrv::modbus::{ModbusPool, ModbusTransport};
use tanksrv::poller::{PollContext, PollStats, Poller};
use tanksrv::publisher::MqttPublisher;
use tanksrv::wait_for_shutdown;

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;
    init_logging();
    info!(site = %config.site_id, "starting tank gateway");

    // Configuration discovery; a broken config dir is fatal at startup.
    let loader = Arc::new(FamilyLoader::new(
        &config.config_dir,
        config.bmm_enable_filter,
    )?);

    let cancel = CancellationToken::new();

    // Transport: pooled Modbus TCP clients with an idle-close sweeper.
    let pool = ModbusPool::new(
        Duration::from_millis(config.connect_timeout_ms),
        Duration::from_millis(config.idle_close_ms),
    );
    let sweeper = pool.start_idle_sweeper(cancel.clone());
    let transport = Arc::new(ModbusTransport::new(
        pool.clone(),
        Duration::from_millis(config.request_timeout_ms),
        config.max_retries,
    ));

    let cache = Arc::new(LiveCache::new());

    let log_writer = LogWriter::start(LogWriterConfig {
        log_dir: config.log_dir.clone(),
        config_dir: config.config_dir.clone(),
        site_id: config.site_id.clone(),
        min_interval: Duration::from_millis(config.log_min_interval_ms),
        queue_depth: 256,
    })?;

    let publisher = Arc::new(MqttPublisher::connect(&config));

    let notifier: Option<Arc<dyn AlarmNotifier>> = config
        .webhook_url
        .clone()
        .map(|url| Arc::new(WebhookNotifier::new(url)) as Arc<dyn AlarmNotifier>);
    let alarms = Arc::new(AlarmEngine::new(
        config.config_dir.join("alarmSettings.json"),
        config.connectivity_alarm_ms(),
        config.site_id.clone(),
        notifier,
    )?);

    let stats = Arc::new(PollStats::default());
    let ctx = Arc::new(PollContext {
        loader: loader.clone(),
        reader: transport,
        cache: cache.clone(),
        publisher: publisher.clone(),
        log_writer: log_writer.clone(),
        alarms: alarms.clone(),
        stats: stats.clone(),
        site_id: config.site_id.clone(),
    });

    let poller = Poller::new(
        ctx,
        Duration::from_millis(config.poll_interval_ms),
        Duration::from_millis(config.reload_interval_ms),
        config.concurrency,
        cancel.clone(),
    );
    let poller_handle = tokio::spawn(poller.run());

    let api_state = Arc::new(ApiState {
        cache,
        loader,
        alarms,
        stats,
        log_dir: config.log_dir.clone(),
        started_at: Instant::now(),
    });
    let api_cancel = cancel.clone();
    let api_host = config.api_host.clone();
    let api_port = config.api_port;
    let disable_hsts = config.disable_hsts;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, &api_host, api_port, disable_hsts, api_cancel).await {
            error!("api server failed: {e}");
        }
    });

    wait_for_shutdown().await;
    info!("shutdown signal received, finishing in-flight tick");
    cancel.cancel();

    // The in-flight tick completes before the poller returns; only then is
    // the log queue drained and the broker connection closed.
    if let Err(e) = poller_handle.await {
        error!("poller task failed: {e}");
    }
    log_writer.shutdown().await;
    publisher.disconnect().await;
    pool.shutdown().await;
    sweeper.abort();
    if let Err(e) = api_handle.await {
        error!("api task failed: {e}");
    }

    info!("shutdown complete");
    Ok(())
}
