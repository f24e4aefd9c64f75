//! Typed proxy errors.
//!
//! Disposition rules:
//! - Per-datagram kinds (crypto, framing) are logged and the offending
//!   datagram dropped; the session continues.
//! - Start-time kinds (config, listener bind) surface to the caller of
//!   `start`.
//! - Teardown swallows everything; teardown must complete.

use thiserror::Error;

/// Errors produced by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid configuration or lifecycle misuse (e.g. double start).
    #[error("config error: {0}")]
    Config(String),

    /// AES layer failure: bad key/IV length, ciphertext not block-aligned,
    /// malformed padding.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Inner frame failure: packet too small or HMAC mismatch.
    #[error("framing error: {0}")]
    Framing(String),

    /// Could not dial the upstream server for a new client.
    #[error("session setup error: {0}")]
    SessionSetup(String),

    /// A script callback raised or timed out.
    #[error("script error: {0}")]
    Script(String),

    /// Socket-level failure. Whether it is fatal depends on where it
    /// happens: bind errors at start surface, loop errors are logged and
    /// the iteration continues.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
