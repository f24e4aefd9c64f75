//! Configuration system.
//!
//! Loads the proxy configuration from JSON strings/files (file IO left
//! to the app). Cryptographic material is base64 in the JSON surface and
//! raw bytes in memory.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::IV_LEN;
use crate::error::{ProxyError, Result};

/// serde helper: byte strings as standard base64 in the JSON surface.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_idle_timeout_ms() -> u64 {
    15_000
}

fn default_script_timeout_ms() -> u64 {
    12_000
}

/// Root proxy configuration. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Real upstream game server endpoint.
    pub server_addr: SocketAddr,
    /// Auxiliary endpoint advertised back to the host; opaque to the relay.
    pub ping_addr: SocketAddr,

    /// AES-CBC key; 16, 24, or 32 bytes select the AES variant.
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    /// Fixed AES-CBC IV, reused for the whole session.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// HMAC-SHA256 key authenticating the inner frame.
    #[serde(with = "base64_bytes")]
    pub hmac_key: Vec<u8>,
    /// Opaque session identifier, surfaced verbatim to scripts.
    #[serde(with = "base64_bytes", default)]
    pub session_id: Vec<u8>,

    /// Script source handed to the scripting collaborator after start.
    #[serde(default)]
    pub auto_exec_script: Option<String>,

    /// Per-iteration socket read deadline.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Close the session when no client traffic arrives for this long.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Time limit for one script callback task.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
}

impl ProxyConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Rejects key material the crypto layer cannot use. Run at `start`;
    /// failures surface to the caller.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.key.len(), 16 | 24 | 32) {
            return Err(ProxyError::Config(format!(
                "AES key must be 16, 24, or 32 bytes, is {}",
                self.key.len()
            )));
        }
        if self.iv.len() != IV_LEN {
            return Err(ProxyError::Config(format!(
                "IV must be {IV_LEN} bytes, is {}",
                self.iv.len()
            )));
        }
        if self.hmac_key.is_empty() {
            return Err(ProxyError::Config("HMAC key must not be empty".into()));
        }
        Ok(())
    }

    /// The configuration the downstream client is redirected to:
    /// identical, but with `server_addr` rewritten to the proxy's own
    /// listener endpoint.
    pub fn mitm_config(&self, listen_addr: SocketAddr) -> Self {
        let mut conf = self.clone();
        conf.server_addr = listen_addr;
        conf
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }
}
