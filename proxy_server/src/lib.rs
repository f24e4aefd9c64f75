//! `proxy_server`
//!
//! MITM relay for the UNet datagram protocol:
//! - Loopback listener and per-session upstream dialer (one downstream
//!   client at a time)
//! - Decrypt → track → intercept → re-encrypt pipeline
//! - Injection queues drained ahead of natural reads
//! - Host and script interception hooks
//! - Cooperative shutdown with a join barrier
//!
//! Networking model:
//! - UDP on both sides; every read is deadline-bounded, never indefinite.

pub mod hooks;
pub mod server;

mod session;

pub use hooks::{HostHooks, ScriptApi, ScriptHook, ScriptHost, SessionView};
pub use server::ProxyServer;
