//! Error taxonomy for the redirection core.
//!
//! Errors are classified by kind, not by origin type. Only [`NotFound`] and
//! [`Validation`] ever reach an HTTP client — they surface before the
//! WebSocket upgrade completes. Everything after the upgrade terminates the
//! session silently (the socket simply closes; there is no text channel for
//! error details on the redirection interface).
//!
//! [`NotFound`]: RedirectError::NotFound
//! [`Validation`]: RedirectError::Validation

use thiserror::Error;

/// Errors produced by the redirection core.
#[derive(Debug, Error)]
pub enum RedirectError {
    /// Device GUID absent from the repository (or stored with an empty GUID).
    #[error("device not found")]
    NotFound,

    /// Device-side connect/read/write failure.
    #[error("device transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Browser-side WebSocket I/O failure.
    #[error("websocket: {0}")]
    WebSocket(#[from] axum::Error),

    /// Malformed or truncated AMT redirection frame. Relay loops drop the
    /// frame and continue; this kind never terminates a session.
    #[error("malformed redirection frame: {0}")]
    ProtocolDecode(&'static str),

    /// A digest reply field exceeded the wire format's length limit.
    /// Fatal to the session.
    #[error("digest field exceeds length limit")]
    DigestOverflow,

    /// Invalid caller-supplied parameter (e.g. an unknown redirection mode).
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// Parent context or session cancellation. Not reported to clients.
    #[error("cancelled")]
    Cancelled,

    /// The injected cryptor failed to decrypt a stored device secret.
    #[error("decrypt device secret: {0}")]
    Crypto(String),
}

impl RedirectError {
    /// Whether this error may be surfaced to the HTTP caller (pre-upgrade).
    pub fn is_client_visible(&self) -> bool {
        matches!(self, Self::NotFound | Self::Validation(_))
    }
}
