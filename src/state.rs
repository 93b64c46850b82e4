//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::device::{Cryptor, DeviceRepo};
use crate::metrics::RedirectMetrics;
use crate::redirect::registry::SessionRegistry;
use crate::redirect::transport::TransportFactory;

/// Shared application state for the amtctl server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Device record lookups. The core never owns device storage.
    pub repo: Arc<dyn DeviceRepo>,
    /// Decrypts stored device secrets.
    pub cryptor: Arc<dyn Cryptor>,
    /// Opens device-side redirection transports.
    pub transport_factory: Arc<dyn TransportFactory>,
    /// Live redirection sessions, one per (GUID, mode).
    pub registry: Arc<SessionRegistry>,
    /// Relay traffic counters and histograms.
    pub metrics: Arc<RedirectMetrics>,
    /// Process-wide shutdown signal; every session derives its token from
    /// this one.
    pub shutdown: CancellationToken,
}
