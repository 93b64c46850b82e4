//! AMT redirection interceptor.
//!
//! A browser opens a WebSocket naming a device GUID and a mode (`kvm`,
//! `sol`, `ider`). The interceptor connects to the device's TCP redirection
//! port, completes the redirection handshake and HTTP-Digest authentication
//! on the browser's behalf, and then relays binary frames verbatim in both
//! directions until either peer disconnects or the device goes idle.
//!
//! Module map:
//!
//! - [`codec`] — parses/synthesises the control frames needed to reach
//!   direct-relay mode
//! - [`challenge`] — mutable HTTP-Digest state and the MD5 response
//! - [`transport`] — the device-side TCP/TLS connection
//! - [`session`] — per-(GUID, mode) state
//! - [`registry`] — at-most-one live session per key, reuse and expiry
//! - [`relay`] — the WebSocket endpoint and the per-session task trio

pub mod challenge;
pub mod codec;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;

use std::fmt;
use std::str::FromStr;

use crate::error::RedirectError;

// Redirection protocol command bytes. Every frame starts with one.
pub const CMD_START_REDIRECTION_SESSION: u8 = 0x10;
pub const CMD_START_REDIRECTION_SESSION_REPLY: u8 = 0x11;
pub const CMD_END_REDIRECTION_SESSION: u8 = 0x12;
pub const CMD_AUTHENTICATE_SESSION: u8 = 0x13;
pub const CMD_AUTHENTICATE_SESSION_REPLY: u8 = 0x14;

// AuthenticateSessionReply status / auth-type values.
pub const AUTH_STATUS_SUCCESS: u8 = 0;
pub const AUTH_STATUS_FAILURE: u8 = 2;
pub const AUTH_TYPE_QUERY: u8 = 0;
pub const AUTH_TYPE_DIGEST: u8 = 4;

/// Fixed header length of authenticate-session frames in both directions.
pub const AUTH_HEADER_LEN: usize = 9;

/// Fixed length of a StartRedirectionSessionReply before the OEM trailer.
pub const START_REPLY_LEN: usize = 13;

/// URI named in every digest exchange with the redirection service.
pub const REDIRECTION_URI: &str = "/RedirectionService";

/// Redirection mode requested by the browser. Only used as a metric label
/// and as half of the session key once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Kvm,
    Sol,
    Ider,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Sol => "sol",
            Self::Ider => "ider",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = RedirectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kvm" => Ok(Self::Kvm),
            "sol" => Ok(Self::Sol),
            "ider" => Ok(Self::Ider),
            other => Err(RedirectError::Validation(format!(
                "unknown redirection mode {other:?}"
            ))),
        }
    }
}

/// Identifies a live session in the registry: at most one session exists per
/// key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub guid: String,
    pub mode: Mode,
}

impl SessionKey {
    pub fn new(guid: impl Into<String>, mode: Mode) -> Self {
        Self {
            guid: guid.into(),
            mode,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.guid, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_the_three_redirection_modes() {
        assert_eq!("kvm".parse::<Mode>().unwrap(), Mode::Kvm);
        assert_eq!("sol".parse::<Mode>().unwrap(), Mode::Sol);
        assert_eq!("ider".parse::<Mode>().unwrap(), Mode::Ider);
    }

    #[test]
    fn mode_rejects_anything_else() {
        for bad in ["KVM", "vnc", "", "kvm "] {
            let err = bad.parse::<Mode>().unwrap_err();
            assert!(matches!(err, RedirectError::Validation(_)), "{bad:?}");
        }
    }

    #[test]
    fn session_key_display_joins_guid_and_mode() {
        let key = SessionKey::new("d1c2", Mode::Sol);
        assert_eq!(key.to_string(), "d1c2-sol");
    }
}
