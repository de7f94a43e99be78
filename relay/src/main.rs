//! # termlink Relay Server
//!
//! A WebSocket-based relay that gives phones and browsers access to
//! terminals hosted by **agents** behind NAT. It authenticates agents,
//! binds browser **clients** to a named agent, and forwards terminal
//! frames in both directions.
//!
//! ## Architecture
//!
//! ```text
//! Browser ──WS──► Relay Server ──WS──► Agent ──PTY──► Child CLI
//! ```
//!
//! ## Modules
//!
//! - [`state`]    — shared registries (agents, clients, bindings)
//! - [`broker`]   — table mutations: attach/detach, bind, fan-out
//! - [`handlers`] — WebSocket connection lifecycle and dispatch
//! - [`api`]      — REST control plane and health probe

mod api;
mod broker;
mod handlers;
mod state;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "termlink-relay", about = "Relay server binding browser clients to termlink agents")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,
}

fn parse_args() -> Args {
    Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(if e.use_stderr() { 1 } else { 0 });
    })
}

/// Server entry point.
///
/// Initializes logging, creates the shared state, configures routes, and
/// serves until interrupted. Exits 1 if the listener cannot bind.
#[tokio::main]
async fn main() {
    let args = parse_args();

    // Structured logging with env-filter support. Default log level is
    // `info` for this crate; override with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termlink_relay=info".into()),
        )
        .init();

    let state = AppState::new();

    let app = Router::new()
        .route("/api/agents", post(api::register_agent).get(api::list_agents))
        .route("/api/agents/{id}", get(api::get_agent))
        .route("/ws/agent/{id}", get(handlers::agent_ws))
        .route("/ws/client/{id}", get(handlers::client_ws))
        .route("/health", get(api::health))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from((args.host, args.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("termlink relay listening on {}", addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        // Close every live WebSocket so graceful shutdown is not held
        // open by long-lived peer connections.
        state.close_all_peers();
    });

    if let Err(e) = serve.await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
