//! # amtctl
//!
//! Management console for Intel AMT / vPro devices.
//!
//! The server exposes a small REST surface plus the redirection WebSocket
//! that bridges a browser to a device's KVM/SOL/IDER port, completing the
//! AMT redirection handshake and HTTP-Digest authentication on the
//! browser's behalf.
//!
//! ## API surface
//!
//! | Method | Path                   | Description                              |
//! |--------|------------------------|------------------------------------------|
//! | GET    | `/api/health`          | Liveness probe                           |
//! | GET    | `/metrics`             | Prometheus metrics                       |
//! | GET    | `/relay/{guid}/{mode}` | Redirection WebSocket (`kvm|sol|ider`)   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommand, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! state.rs         — AppState shared by every handler
//! error.rs         — error taxonomy
//! device/          — device records, repo + cryptor contracts
//! metrics.rs       — per-mode relay metrics
//! routes/
//!   health.rs      — GET /api/health
//!   metrics.rs     — GET /metrics
//! redirect/
//!   codec.rs       — AMT redirection frame interception
//!   challenge.rs   — HTTP-Digest state and MD5 response
//!   transport.rs   — device TCP/TLS transport
//!   session.rs     — per-(GUID, mode) session state
//!   registry.rs    — session reuse, expiry, release
//!   relay.rs       — WS upgrade, relay loops, health monitor
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use amtctl::config::Config;
use amtctl::device::{PassthroughCryptor, StaticDeviceRepo};
use amtctl::metrics::RedirectMetrics;
use amtctl::redirect::registry::SessionRegistry;
use amtctl::redirect::relay;
use amtctl::redirect::transport::TcpTransportFactory;
use amtctl::routes;
use amtctl::state::AppState;

/// Management console for Intel AMT / vPro devices.
#[derive(Parser)]
#[command(name = "amtctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("amtctl v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let repo = Arc::new(StaticDeviceRepo::new(config.devices.clone()));
    info!("Managed devices: {}", repo.len());

    if repo.is_empty() {
        warn!("No devices configured — every redirect request will 404");
    }
    if config.redirect.ws_compression {
        warn!("ws_compression requested but not supported by the websocket layer");
    }

    let metrics = RedirectMetrics::new().expect("Failed to register metrics");
    let state = AppState {
        repo,
        cryptor: Arc::new(PassthroughCryptor),
        transport_factory: Arc::new(TcpTransportFactory::new(
            config.redirect.allow_insecure_ciphers,
        )),
        registry: Arc::new(SessionRegistry::new(config.redirect.reuse_window())),
        metrics: Arc::new(metrics),
        config: Arc::new(config),
        start_time: Instant::now(),
        shutdown: CancellationToken::new(),
    };

    let app = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/metrics", get(routes::metrics::metrics))
        .route("/relay/{guid}/{mode}", get(relay::redirect_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup: cancel every live session; their joiners close the device
    // connections and free the registry.
    info!("Shutting down...");
    state.shutdown.cancel();
    state.registry.drain().await;
    info!("Goodbye");
}
