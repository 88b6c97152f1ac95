use axum::{routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use amida_core::SessionState;
use amida_hub::{
    cli::{self, Cli, Commands},
    config::Config,
    handlers::{get_state, health_check},
    hub::{websocket_handler, HubState},
    storage::{MemoryStore, RedisStore, SharedStore},
};

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as debug client
    if let Some(command) = cli.command {
        let result = match command {
            Commands::State { url } => cli::run_state_client(url, None).await,
            Commands::Resolve { url, start } => cli::run_state_client(url, Some(start)).await,
        };
        if let Err(e) = result {
            error!("debug client error: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as server
    let config = Config::from_env();
    info!("starting amida hub on port {}", config.port);

    let store: SharedStore = if config.memory_store {
        info!("using in-memory state store");
        Arc::new(MemoryStore::default())
    } else {
        info!("redis URL: {}", config.redis_url);
        match RedisStore::connect(&config.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("failed to connect to redis: {e:#}");
                std::process::exit(1);
            }
        }
    };

    // A missing or unreadable durable copy degrades to an empty ladder.
    let initial = match store.load().await {
        Ok(Some(state)) => {
            info!(
                "restored persisted state: {} rung(s), phase {:?}",
                state.rungs().len(),
                state.phase()
            );
            state
        }
        Ok(None) => SessionState::new(),
        Err(e) => {
            warn!("failed to load persisted state, starting empty: {e:#}");
            SessionState::new()
        }
    };

    let hub = HubState::new(config.layout(), initial, store);
    let flush_task = hub.spawn_flush_task(Duration::from_secs(config.flush_interval_seconds));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/state", get(get_state))
        .route("/ws", get(websocket_handler))
        .with_state(hub.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("amida hub listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    // Final flush so a graceful shutdown never loses the latest mutation.
    flush_task.abort();
    if let Err(e) = hub.flush().await {
        warn!("final flush failed: {e:#}");
    }
    info!("amida hub stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
