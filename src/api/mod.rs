//! HTTP read/control surface
//!
//! JSON only, CORS-permissive, security headers on every response. Handlers
//! live in [`handlers`]; this module owns the router and the server lifecycle.

pub mod handlers;

use axum::http::{header, HeaderValue};
use axum::routing::get;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use crate::alarm::AlarmEngine;
use crate::error::{Result, TankSrvError};
use crate::family::FamilyLoader;
use crate::live_cache::LiveCache;
use crate::poller::PollStats;

/// Shared state handed to every handler.
pub struct ApiState {
    pub cache: Arc<LiveCache>,
    pub loader: Arc<FamilyLoader>,
    pub alarms: Arc<AlarmEngine>,
    pub stats: Arc<PollStats>,
    pub log_dir: PathBuf,
    pub started_at: Instant,
}

/// Build the full route table.
pub fn router(state: Arc<ApiState>, disable_hsts: bool) -> Router {
    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/snapshots", get(handlers::get_snapshots))
        .route("/api/snapshots/{tank_id}", get(handlers::get_snapshot))
        .route("/api/tanks", get(handlers::get_tanks))
        .route(
            "/api/devices/enable",
            get(handlers::get_enable_map).put(handlers::put_enable_map),
        )
        .route("/api/logs/query", get(handlers::query_logs))
        .route("/api/logs/files", get(handlers::list_files))
        .route("/api/logs/files/{name}", get(handlers::download_file))
        .route(
            "/api/alarms/thresholds",
            get(handlers::get_thresholds).post(handlers::set_thresholds),
        )
        .route("/api/co2", get(handlers::get_co2))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .with_state(state);

    if !disable_hsts {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ));
    }
    app
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(
    state: Arc<ApiState>,
    host: &str,
    port: u16,
    disable_hsts: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(state, disable_hsts);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| TankSrvError::ApiError(format!("failed to bind {host}:{port}: {e}")))?;
    info!("api listening on {host}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| TankSrvError::ApiError(format!("server error: {e}")))?;
    Ok(())
}
