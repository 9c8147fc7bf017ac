//! `phantom://` share URLs.
//!
//! An operational convenience for handing a peer everything it needs in one
//! string: `phantom://BASE64(JSON{v, server, port, psk[, transport]})`.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::PROTOCOL_VERSION;

/// URL scheme prefix.
pub const SCHEME: &str = "phantom://";

/// Connection bundle carried by a share URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    /// Protocol version
    pub v: u8,
    /// Server hostname or IP
    pub server: String,
    /// Server port
    pub port: u16,
    /// Base64 pre-shared key
    pub psk: String,
    /// Optional substrate hint (`udp` or `tcp`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

impl ShareInfo {
    /// Build a bundle for the current protocol version.
    pub fn new(server: impl Into<String>, port: u16, psk: impl Into<String>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            server: server.into(),
            port,
            psk: psk.into(),
            transport: None,
        }
    }

    /// Render the share URL.
    pub fn to_url(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::config(e.to_string()))?;
        Ok(format!("{SCHEME}{}", STANDARD.encode(json)))
    }

    /// Parse a share URL back into a bundle.
    pub fn from_url(url: &str) -> Result<Self> {
        let encoded = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::malformed("missing phantom:// scheme"))?;
        let json = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::malformed(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| Error::malformed(format!("invalid bundle: {e}")))
    }
}
