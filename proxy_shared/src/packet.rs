//! Relayed-datagram types.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::frame::{self, UnetPacket};

/// Label used until richer packet classification exists.
pub const UNKNOWN_PACKET_NAME: &str = "Unknown";

/// One relayed datagram, as seen by interception hooks.
///
/// `data` is the decrypted outer payload: the full inner frame
/// including UID and tag, not the ciphertext off the wire.
#[derive(Debug, Clone)]
pub struct Packet {
    pub is_send: bool,
    pub time: DateTime<Utc>,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
    pub name: String,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(is_send: bool, src_addr: SocketAddr, dst_addr: SocketAddr, data: Vec<u8>) -> Self {
        Self {
            is_send,
            time: Utc::now(),
            src_addr,
            dst_addr,
            name: UNKNOWN_PACKET_NAME.to_string(),
            data,
        }
    }
}

/// Capture egress record handed to the host when capturing is enabled.
///
/// `payload` is the decrypted inner payload field only; the UID and the
/// HMAC tag are stripped.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
    pub is_send: bool,
    pub name: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

impl CaptureRecord {
    /// Builds a record by parsing the packet's current frame. Fails when
    /// the frame no longer parses (e.g. a hook substituted raw bytes).
    pub fn from_packet(pkt: &Packet, hmac_key: &[u8]) -> Result<Self> {
        let UnetPacket { payload, .. } = frame::deserialize(&pkt.data, hmac_key)?;
        Ok(Self {
            src_addr: pkt.src_addr,
            dst_addr: pkt.dst_addr,
            is_send: pkt.is_send,
            name: pkt.name.clone(),
            timestamp: pkt.time.timestamp(),
            payload,
        })
    }
}
