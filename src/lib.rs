#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

//! amtctl library — management console core for Intel AMT / vPro devices.
//!
//! The interesting subsystem is the redirection interceptor: a relay that
//! bridges a browser WebSocket to a device's TCP redirection port,
//! transparently completing the AMT redirection handshake and HTTP-Digest
//! authentication, then forwarding KVM/SOL/IDER frames verbatim.
//!
//! Building blocks:
//! - `redirect` — frame codec, device transport, sessions, registry, relay
//! - `device` — device records and the repo/cryptor collaborator contracts
//! - `metrics` — per-mode traffic and latency metrics
//! - `config` — configuration loading
//! - `routes` — the (small) REST surface

pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod redirect;
pub mod routes;
pub mod state;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::RedirectError;
pub use metrics::RedirectMetrics;
pub use redirect::registry::SessionRegistry;
pub use state::AppState;
