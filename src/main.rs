//! Duel FPS Server - authoritative server for a single 1v1 match
//!
//! One process hosts exactly one match:
//! - WebSocket endpoint for the two expected players
//! - Fixed 60 Hz simulation with rapier3d physics
//! - Result reporting once the match is decided

mod app;
mod config;
mod game;
mod http;
mod report;
mod util;
mod ws;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::game::{GameMatch, MapDefinition, MatchServer};
use crate::http::build_router;
use crate::report::ResultReporter;
use crate::util::time::init_server_time;

/// Time given to connection writers to flush the final messages
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level, config.log_json);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Duel FPS Server");
    info!(
        match_id = %config.settings.match_id,
        map_id = %config.settings.map_id,
        players = ?[&config.settings.players[0].id, &config.settings.players[1].id],
        "Match configuration loaded"
    );

    // Bind before building the match so a taken port fails fast
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    // Load map and build the match
    let (map, degraded) = MapDefinition::load_or_fallback(&config.map_dir, &config.settings.map_id);
    let server = MatchServer::new(config.settings.clone(), map, degraded);
    let (game_match, match_handle) = GameMatch::new(server);

    let reporter = ResultReporter::new(config.result_webhook_url.clone());
    let state = AppState::new(config, match_handle);
    let router = build_router(state);

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let mut match_task = tokio::spawn(game_match.run());
    let serve = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    let outcome = tokio::select! {
        served = serve => {
            served?;
            None
        }
        finished = &mut match_task => finished?,
    };

    match outcome {
        Some(result) => {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            if let Err(e) = reporter.report(&result).await {
                error!(error = %e, "Failed to report match result");
            }
        }
        None => {
            warn!("Server stopped before the match finished");
            match_task.abort();
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
