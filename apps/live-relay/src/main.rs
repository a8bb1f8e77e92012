use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use live_relay::cli::{self, Cli, Commands};
use live_relay::lifecycle::SystemClock;
use live_relay::store::{MemorySessionStore, RedisSessionStore, SharedSessionStore};
use live_relay::telemetry::Telemetry;
use live_relay::{build_router, RelayConfig, RelayState};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    match args.command {
        Some(Commands::Probe {
            url,
            room,
            user,
            name,
            say,
            seconds,
        }) => {
            Telemetry::init_client()?;
            cli::run_probe(url, room, user, name, say, seconds).await
        }
        Some(Commands::Serve { port }) => serve(port).await,
        None => serve(None).await,
    }
}

async fn serve(port: Option<u16>) -> Result<()> {
    let telemetry = Telemetry::init()?;
    let mut config = RelayConfig::from_env();
    if let Some(port) = port {
        config.port = port;
    }
    info!(
        port = config.port,
        public_url = %config.public_base_url(),
        redis = config.redis_url.is_some(),
        session_ttl_seconds = config.session_ttl_seconds,
        "starting live-relay"
    );
    run(config, telemetry.metrics_handle()).await
}

async fn session_store(config: &RelayConfig) -> SharedSessionStore {
    let Some(redis_url) = config.redis_url.as_deref() else {
        info!("REDIS_URL not set; keeping sessions in memory");
        return MemorySessionStore::new();
    };
    match RedisSessionStore::new(redis_url, config.session_ttl_seconds).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(error = %err, "failed to connect to redis; falling back to in-memory sessions");
            MemorySessionStore::new()
        }
    }
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let store = session_store(&config).await;
    let addr = format!("0.0.0.0:{}", config.port);
    let sweep_interval = config.sweep_interval;
    let flush_grace = config.flush_timeout;

    let state = RelayState::new(config, store, Arc::new(SystemClock), Some(metrics));
    let sweeper = state
        .lifecycle
        .spawn_sweeper(sweep_interval, state.shutdown.clone());
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("live-relay listening on {}", addr);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            let closed = shutdown_state.begin_shutdown();
            info!(closed, "shutdown signal received");
        })
        .await
        .context("server shutdown with error")?;

    // let writers flush their close frames
    tokio::time::sleep(flush_grace).await;
    if let Err(err) = sweeper.await {
        warn!(error = %err, "sweeper task failed");
    }
    info!("graceful shutdown complete");
    Ok(())
}
