//! Quote Stream Engine Binary
//!
//! Connects to the chart quoting service, subscribes to the configured
//! series, and logs every closed or updated bar.
//!
//! # Usage
//!
//! ```bash
//! QUOTE_STREAM_SYMBOLS=BINANCE:BTCUSD:1,NASDAQ:AAPL:1D cargo run --bin quote-stream-engine
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `QUOTE_STREAM_SYMBOLS`: Comma-separated `EXCHANGE:SYMBOL:INTERVAL` list
//!
//! ## Optional
//! - `QUOTE_STREAM_AUTH_TOKEN`: Session token (default: anonymous)
//! - `QUOTE_STREAM_ENDPOINT`: WebSocket URL
//! - `QUOTE_STREAM_DELIVERY_POLICY`: every_update | closed_bars_only
//! - `QUOTE_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quote_stream_engine::domain::fanout::ConsumerError;
use quote_stream_engine::infrastructure::health::{HealthServer, HealthServerState};
use quote_stream_engine::infrastructure::telemetry;
use quote_stream_engine::{
    EngineConfig, StreamEngine, SymbolKey, Update, WebSocketConnector, init_metrics,
    parse_symbol_list,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv_from_ancestors();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting Quote Stream Engine");

    let _metrics_handle = init_metrics()?;

    let config = EngineConfig::from_env()?;
    let symbols = std::env::var("QUOTE_STREAM_SYMBOLS")
        .context("QUOTE_STREAM_SYMBOLS is required")
        .and_then(|raw| parse_symbol_list(&raw).map_err(Into::into))?;
    log_config(&config, &symbols);

    let shutdown_token = CancellationToken::new();

    let connector = Arc::new(WebSocketConnector::from_settings(&config.websocket));
    let health_port = config.server.health_port;
    let policy = config.session.delivery_policy;
    let engine = Arc::new(StreamEngine::new(config, connector));

    engine.on_state_change(|state| tracing::info!(state = %state, "Quote stream state"));

    // Subscriptions made before start are replayed on the first connection.
    let mut symbol_sets = Vec::with_capacity(symbols.len());
    for key in symbols {
        let set = engine.create_symbol_set_with(key, policy)?;
        set.create_consumer_fn(log_update);
        symbol_sets.push(set);
    }

    engine.start().await?;

    let fault_engine = Arc::clone(&engine);
    let fault_cancel = shutdown_token.clone();
    tokio::spawn(async move {
        let mut faults = fault_engine.faults();
        loop {
            tokio::select! {
                () = fault_cancel.cancelled() => break,
                fault = faults.recv() => match fault {
                    Ok(fault) => tracing::debug!(key = %fault.key, error = %fault.error, "Consumer fault"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Consumer fault stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&engine),
    ));
    let health_server = HealthServer::new(health_port, health_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(symbol_sets = symbol_sets.len(), "Quote stream engine ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, engine.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Engine shutdown timed out");
    }

    tracing::info!("Quote stream engine stopped");
    Ok(())
}

#[allow(clippy::unnecessary_wraps)]
fn log_update(update: &Update) -> Result<(), ConsumerError> {
    tracing::info!(
        key = %update.key,
        time = %update.bar.time,
        open = %update.bar.open,
        high = %update.bar.high,
        low = %update.bar.low,
        close = %update.bar.close,
        volume = %update.bar.volume,
        "Bar"
    );
    Ok(())
}

fn log_config(config: &EngineConfig, symbols: &[SymbolKey]) {
    tracing::info!(
        anonymous = config.credential.is_anonymous(),
        endpoint = %config.websocket.endpoint,
        series_bars = config.session.series_bars,
        trading_session = config.session.trading_session.as_str(),
        health_port = config.server.health_port,
        symbols = symbols.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        idle_timeout_secs = config.websocket.idle_timeout.as_secs(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        "Connection settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
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

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
