//! Call Controller
//!
//! Pairs chat channels from different communities into anonymous call
//! sessions and coordinates queueing, matching and call state across many
//! controller processes through a shared Redis store.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to Redis (shared store) and Postgres (ended-call archive)
//! 4. Run pending database migrations
//! 5. Wire the components and start them in dependency order
//! 6. Start the health HTTP server (liveness, readiness, metrics)
//! 7. Wait for shutdown signal, then stop components in reverse order

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;

use call_controller::config::Config;
use call_controller::coordinator::LeaderCoordinator;
use call_controller::events::{BroadcastBus, EventBus};
use call_controller::manager::CallManager;
use call_controller::matching::MatchingEngine;
use call_controller::observability::metrics::init_metrics_recorder;
use call_controller::observability::{observability_router, HealthState};
use call_controller::queue::QueueManager;
use call_controller::state::{CallStateStore, PgCallArchive};
use call_controller::store::{RedisStore, SharedStore};
use common::secret::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Call Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        health_bind_address = %config.health_bind_address,
        queue_timeout_seconds = config.queue_timeout_seconds,
        queue_capacity = config.queue_capacity,
        sweep_interval_ms = config.sweep_interval_ms,
        lease_ttl_ms = config.lease_ttl_ms,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let health_state = Arc::new(HealthState::new());

    // Connect to the shared store
    info!("Connecting to Redis...");
    let store: Arc<dyn SharedStore> =
        Arc::new(RedisStore::connect(config.redis_url.expose_secret()).await?);
    info!("Redis connection established");

    // Connect to the durable archive and apply migrations
    info!("Connecting to Postgres...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Postgres");
            e
        })?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Postgres connection established");

    // Wire the components
    let bus: Arc<dyn EventBus> = Arc::new(BroadcastBus::default());
    let state = CallStateStore::new(
        store.clone(),
        Arc::new(PgCallArchive::new(pool)),
        bus.clone(),
        config.state(),
    );
    let coordinator =
        LeaderCoordinator::new(store.clone(), config.node_id.clone(), config.coordinator());
    let queue = QueueManager::new(store.clone(), bus.clone(), config.queue());
    let matching = MatchingEngine::new(
        store.clone(),
        queue.clone(),
        state.clone(),
        coordinator.clone(),
        bus.clone(),
        config.matching(),
    );
    let manager = CallManager::new(
        queue,
        matching,
        state,
        coordinator,
        bus,
        config.node_id.clone(),
    );

    manager.start().await.map_err(|e| {
        error!(error = %e, "Failed to start components");
        e
    })?;
    health_state.set_ready();
    info!("All components started");

    // Health/metrics HTTP server
    let router = observability_router(health_state.clone(), prometheus_handle)
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.health_bind_address).await?;
    info!(address = %config.health_bind_address, "Health endpoints listening");
    let health_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "Health server exited with error");
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    health_state.set_not_ready();
    manager.stop().await;
    health_server.abort();

    info!("Call Controller stopped");
    Ok(())
}

/// Completes on SIGINT (ctrl-c) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
