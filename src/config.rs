//! Server configuration.
//!
//! A flat TOML record:
//!
//! ```toml
//! listen = ":54321"
//! psk = "BASE64-OF-32-BYTES"
//! time_window = 30
//! log_level = "info"
//! ```

use serde::Deserialize;

use crate::crypto::decode_psk;
use crate::error::{Error, Result};

/// Runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Substrate bind address, `host:port` or `:port`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base64 of exactly 32 raw bytes. Required.
    pub psk: String,
    /// Subkey rotation granularity in seconds, 1..=300.
    #[serde(default = "default_time_window")]
    pub time_window: u64,
    /// One of `error`, `info`, `debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    ":54321".into()
}

fn default_time_window() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {path}: {e}")))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| Error::config(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field; called again by [`Server::new`](crate::server::Server::new).
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(Error::config("listen cannot be empty"));
        }
        if self.psk.is_empty() {
            return Err(Error::config("psk is required"));
        }
        decode_psk(&self.psk)?;
        if !(1..=300).contains(&self.time_window) {
            return Err(Error::config("time_window must be within 1..=300"));
        }
        match self.log_level.as_str() {
            "error" | "info" | "debug" => Ok(()),
            other => Err(Error::config(format!("unknown log_level: {other}"))),
        }
    }

    /// The bind address with a bare `:port` normalized to all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}
