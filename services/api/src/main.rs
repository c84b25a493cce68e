mod config;
mod error;
mod handlers;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use config::{Config, Provider};
use handlers::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use wayfinder_core::Navigator;
use wayfinder_core::refiner::{OfflineRefiner, Refiner, RefinerClient};
use wayfinder_core::routing::OsrmClient;

/// Turn-by-turn pedestrian navigation service.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Address to listen on; overrides BIND_ADDRESS
    #[arg(long)]
    bind: Option<SocketAddr>,
}

fn router(state: AppState) -> Router {
    // Permissive CORS so a separately hosted client can call the API.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/navigation/start", post(handlers::start_navigation))
        .route("/api/location", post(handlers::post_location))
        .route("/api/vision", post(handlers::post_vision))
        .route("/api/navigation/instruction", get(handlers::get_instruction))
        .route("/api/navigation/advance", post(handlers::advance))
        .route("/api/navigation/route", get(handlers::get_route))
        .route("/api/navigation/reroute", post(handlers::reroute))
        .route("/api/status", get(handlers::status))
        .route("/api/stop", post(handlers::stop))
        .route("/ws", get(handlers::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Periodically drops sessions that have gone quiet.
fn spawn_idle_eviction(navigator: Arc<Navigator>) {
    let ttl = navigator.config().session_idle_ttl;
    let period = (ttl / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = navigator.evict_idle(chrono::Utc::now()).await;
            for id in evicted {
                info!("Session {} expired after {:?} idle", id, ttl);
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    info!("Configuration loaded successfully. Starting Wayfinder service...");

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    let addr = args.bind.unwrap_or(config.bind_address);

    // --- 4. Initialize API Clients ---
    let refiner: Arc<dyn Refiner> = match (&config.provider, &config.openai_api_key) {
        (Provider::OpenAI, Some(key)) => {
            info!("Refining instructions with {}", config.chat_model);
            Arc::new(RefinerClient::with_api_base(
                key.clone(),
                config.chat_model.clone(),
                config.refiner_api_base.clone(),
            ))
        }
        _ => {
            info!("No language model configured; serving template instructions");
            Arc::new(OfflineRefiner)
        }
    };
    let router_client = Arc::new(OsrmClient::new(config.routing_base_url.clone()));
    info!("Routing with OSRM at {}", config.routing_base_url);

    // --- 5. Application Setup ---
    let state = AppState::new(Navigator::new(router_client, refiner, config.navigation.clone()));
    spawn_idle_eviction(Arc::clone(&state.navigator));
    let app = router(state);

    // --- 6. Serve ---
    info!("Starting HTTP server, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
