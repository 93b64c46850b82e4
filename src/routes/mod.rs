//! REST route handlers.
//!
//! The console's REST surface is deliberately small: a liveness probe and
//! the metrics scrape. Everything interesting happens on the redirection
//! WebSocket (`redirect::relay`).

pub mod health;
pub mod metrics;
