//! Shared helpers for the proxy integration tests.
//!
//! Provides a fixed key set, frame/ciphertext builders, and a fake
//! upstream endpoint so the test files stay focused on scenarios.

use std::net::SocketAddr;
use std::time::Duration;

use proxy_shared::config::ProxyConfig;
use proxy_shared::crypto::aes_cbc_encrypt;
use proxy_shared::frame::{serialize, UnetPacket, UID_LEN};
use tokio::net::UdpSocket;

pub const KEY: [u8; 16] = [0x11; 16];
pub const IV: [u8; 16] = [0x22; 16];
pub const HMAC_KEY: &[u8] = b"integration hmac key";

/// Test configuration pointed at `server_addr`, with snappy read
/// deadlines so tests finish quickly.
pub fn test_config(server_addr: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        server_addr,
        ping_addr: "127.0.0.1:19999".parse().unwrap(),
        key: KEY.to_vec(),
        iv: IV.to_vec(),
        hmac_key: HMAC_KEY.to_vec(),
        session_id: b"test-session".to_vec(),
        auto_exec_script: None,
        read_timeout_ms: 50,
        idle_timeout_ms: 15_000,
        script_timeout_ms: 2_000,
    }
}

/// Builds the decrypted inner frame `uid || payload || tag`.
pub fn build_frame(uid: [u8; UID_LEN], payload: &[u8]) -> Vec<u8> {
    serialize(
        &UnetPacket {
            uid,
            payload: payload.to_vec(),
        },
        HMAC_KEY,
    )
    .unwrap()
}

/// Builds the on-the-wire ciphertext for a frame.
pub fn build_wire(uid: [u8; UID_LEN], payload: &[u8]) -> Vec<u8> {
    aes_cbc_encrypt(&build_frame(uid, payload), &KEY, &IV).unwrap()
}

/// Encrypts raw plaintext the way the injection path does (no framing).
pub fn encrypt_raw(plain: &[u8]) -> Vec<u8> {
    aes_cbc_encrypt(plain, &KEY, &IV).unwrap()
}

/// Receives one datagram or gives up after `timeout`.
pub async fn recv_datagram(
    sock: &UdpSocket,
    timeout: Duration,
) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 2048];
    match tokio::time::timeout(timeout, sock.recv_from(&mut buf)).await {
        Ok(Ok((n, from))) => Some((buf[..n].to_vec(), from)),
        _ => None,
    }
}

/// Binds an ephemeral loopback UDP socket standing in for the real game
/// server (or the game client).
pub async fn bind_ephemeral() -> (UdpSocket, SocketAddr) {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    (sock, addr)
}

/// Installs the test log subscriber; safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}
