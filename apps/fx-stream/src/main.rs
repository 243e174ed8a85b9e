//! FX Stream Binary
//!
//! Starts the FX tick ingestion service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin fx-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FX_API_KEY`: Provider API key
//!
//! ## Optional
//! - `FX_PROVIDER`: twelvedata | polygon (default: twelvedata)
//! - `FX_PAIRS`: Comma-separated pairs (default: EUR/USD)
//! - `FX_MAX_PAIRS`: Working set limit (default: 12)
//! - `FX_BUFFER_CAPACITY`: Per-consumer buffer capacity (default: 2048)
//! - `FX_SUBSCRIPTION_TIMEOUT_SECS`, `FX_STALENESS_TIMEOUT_SECS`,
//!   `FX_HEARTBEAT_INTERVAL_SECS`: Session timing (default: 10, 30, 15)
//! - `FX_RECONNECT_DELAY_INITIAL_MS`, `FX_RECONNECT_DELAY_MAX_SECS`,
//!   `FX_RECONNECT_DELAY_MULTIPLIER`, `FX_RECONNECT_JITTER`,
//!   `FX_MAX_RECONNECT_ATTEMPTS`, `FX_STABLE_LIVE_SECS`: Backoff policy
//! - `FX_MAX_PRICE_AGE_SECS`: Stale price threshold (default: 300)
//! - `FX_CLOSE_TIMEOUT_SECS`: Wait for a transport close (default: 2)
//! - `FX_SHUTDOWN_TIMEOUT_SECS`: Graceful stop bound (default: 10)
//! - `FX_SHUTDOWN_MODE`: drain | discard (default: drain)
//! - `FX_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use fx_stream::application::services::ConnectionMonitor;
use fx_stream::infrastructure::health::{HealthServer, HealthServerState};
use fx_stream::infrastructure::telemetry;
use fx_stream::{ConnectionState, StreamConfig, StreamSupervisor, Tick, WsConnector, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let telemetry_guard = telemetry::init();

    tracing::info!(otlp_export = telemetry_guard.is_exporting(), "Starting FX stream");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = StreamConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let adapter = config.provider.adapter(config.credentials.api_key());
    let supervisor = Arc::new(
        StreamSupervisor::new(
            config.supervisor_config(),
            adapter,
            Arc::new(WsConnector::default()),
        )
        .context("failed to build stream supervisor")?,
    );

    supervisor.subscribe(log_tick);

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&supervisor),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    supervisor.start()?;
    tracing::info!("FX stream ready");

    let monitor = supervisor.monitor();
    let gave_up = tokio::select! {
        () = await_shutdown() => false,
        () = await_give_up(&monitor) => true,
    };

    tracing::info!(
        timeout_secs = config.shutdown.timeout.as_secs(),
        "Graceful shutdown started"
    );
    supervisor.stop().await;
    shutdown_token.cancel();

    if gave_up {
        let reason = monitor
            .connection_health()
            .last_error
            .unwrap_or_else(|| "unknown error".to_string());
        anyhow::bail!("provider connection ended: {reason}");
    }
    tracing::info!("FX stream stopped");
    Ok(())
}

/// Default consumer: log every delivered tick.
fn log_tick(tick: Tick) {
    tracing::debug!(
        pair = %tick.pair(),
        bid = ?tick.bid(),
        ask = ?tick.ask(),
        mid = ?tick.mid(),
        spread = ?tick.spread(),
        sequence = tick.sequence(),
        timestamp = %tick.timestamp(),
        "Tick"
    );
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        provider = config.provider.as_str(),
        pairs = ?config.stream.pairs,
        max_pairs = config.stream.max_pairs,
        buffer_capacity = config.stream.buffer_capacity,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        subscription_timeout_secs = config.websocket.subscription_timeout.as_secs(),
        staleness_timeout_secs = config.websocket.staleness_timeout.as_secs(),
        heartbeat_interval_secs = config.websocket.heartbeat_interval.as_secs(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        shutdown_mode = ?config.shutdown.mode,
        "Connection settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Resolve once the connection leaves `Disconnected` and later returns to it.
///
/// While running, the connection only returns to `Disconnected` when the
/// reconnect attempts are exhausted or the provider rejects the credentials.
async fn await_give_up(monitor: &ConnectionMonitor) {
    let mut state = monitor.subscribe_state();
    if state
        .wait_for(|s| *s != ConnectionState::Disconnected)
        .await
        .is_err()
    {
        return std::future::pending::<()>().await;
    }
    if state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .is_err()
    {
        return std::future::pending::<()>().await;
    }
    tracing::error!("Provider connection ended, shutting down");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
