//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AMTCTL_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `amtctl.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8181"
//!
//! [logging]
//! level = "info"
//!
//! [redirect]
//! inactivity_timeout_secs = 30   # close a session this long after device silence
//! reuse_window_secs = 300        # browser refresh rejoins the session within this
//! health_period_secs = 30       # monitor tick
//! ws_read_buffer_bytes = 65536
//! ws_write_buffer_bytes = 65536
//! ws_compression = false
//! allow_insecure_ciphers = true
//!
//! [[devices]]
//! guid = "d1a2b3c4-0000-0000-0000-000000000001"
//! username = "admin"
//! password = "P@ssw0rd"
//! address = "192.168.1.50"       # host or host:port; defaults to 16995/16994
//! use_tls = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::device::Device;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
    /// Managed device inventory for the in-memory repository.
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8181`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Redirection relay tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct RedirectConfig {
    /// Seconds of device silence before a session is shut down (default 30).
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    /// Seconds of idle time under which a new browser open rejoins the
    /// existing session instead of reconnecting to the device (default 300).
    #[serde(default = "default_reuse_window")]
    pub reuse_window_secs: u64,
    /// Seconds between health-monitor ticks (default 30).
    #[serde(default = "default_health_period")]
    pub health_period_secs: u64,
    /// Per-message read cap on the browser websocket (default 64 KiB).
    #[serde(default = "default_ws_buffer")]
    pub ws_read_buffer_bytes: usize,
    /// Write buffer on the browser websocket (default 64 KiB).
    #[serde(default = "default_ws_buffer")]
    pub ws_write_buffer_bytes: usize,
    /// Request per-message-deflate on the browser websocket (default false).
    /// **Not currently enforced** — the websocket layer in use does not
    /// implement compression extensions.
    #[serde(default)]
    pub ws_compression: bool,
    /// Admit TLS 1.2 on device connections (default true). AMT firmware
    /// generations before 16.x never negotiate 1.3.
    #[serde(default = "default_allow_insecure_ciphers")]
    pub allow_insecure_ciphers: bool,
}

impl RedirectConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn reuse_window(&self) -> Duration {
        Duration::from_secs(self.reuse_window_secs)
    }

    pub fn health_period(&self) -> Duration {
        Duration::from_secs(self.health_period_secs)
    }
}

fn default_listen() -> String {
    "0.0.0.0:8181".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_inactivity_timeout() -> u64 {
    30
}
fn default_reuse_window() -> u64 {
    300
}
fn default_health_period() -> u64 {
    30
}
fn default_ws_buffer() -> usize {
    64 * 1024
}
fn default_allow_insecure_ciphers() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout(),
            reuse_window_secs: default_reuse_window(),
            health_period_secs: default_health_period(),
            ws_read_buffer_bytes: default_ws_buffer(),
            ws_write_buffer_bytes: default_ws_buffer(),
            ws_compression: false,
            allow_insecure_ciphers: default_allow_insecure_ciphers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            redirect: RedirectConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `amtctl.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("amtctl.toml").exists() {
            let content =
                std::fs::read_to_string("amtctl.toml").expect("Failed to read amtctl.toml");
            toml::from_str(&content).expect("Failed to parse amtctl.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("AMTCTL_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}
