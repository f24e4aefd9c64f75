//! Inner datagram framing.
//!
//! Every decrypted datagram carries:
//!
//! ```text
//! uid[3] || payload[*] || HMAC-SHA256(uid || payload, hmac_key)[32]
//! ```
//!
//! There is no length field; the UDP datagram length delimits the frame.
//! The 3-byte UID is an opaque session handle assigned by the upstream
//! server; all zeroes means "no session yet".

use bytes::{BufMut, BytesMut};

use crate::crypto::{hmac_sum, hmac_verify, HMAC_LEN};
use crate::error::{ProxyError, Result};

/// Session UID length.
pub const UID_LEN: usize = 3;

/// Trailing HMAC-SHA256 tag length.
pub const TAG_LEN: usize = HMAC_LEN;

/// Smallest valid frame: uid + at least one sequence byte + tag.
pub const MIN_FRAME_LEN: usize = UID_LEN + 1 + TAG_LEN;

/// UID value meaning "no session yet".
pub const UID_SENTINEL: [u8; UID_LEN] = [0, 0, 0];

/// Parsed inner frame. The wire tag is stripped on parse and reappended
/// on serialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnetPacket {
    pub uid: [u8; UID_LEN],
    pub payload: Vec<u8>,
}

/// Parses and authenticates a frame.
pub fn deserialize(buf: &[u8], hmac_key: &[u8]) -> Result<UnetPacket> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(ProxyError::Framing(format!(
            "packet too small (expected >= {MIN_FRAME_LEN}, is {})",
            buf.len()
        )));
    }

    let (body, tag) = buf.split_at(buf.len() - TAG_LEN);
    hmac_verify(body, hmac_key, tag)?;

    let mut uid = [0u8; UID_LEN];
    uid.copy_from_slice(&body[..UID_LEN]);

    Ok(UnetPacket {
        uid,
        payload: body[UID_LEN..].to_vec(),
    })
}

/// Serializes a frame, computing and appending the tag.
pub fn serialize(pkt: &UnetPacket, hmac_key: &[u8]) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(UID_LEN + pkt.payload.len() + TAG_LEN);
    buf.put_slice(&pkt.uid);
    buf.put_slice(&pkt.payload);

    let tag = hmac_sum(&buf, hmac_key)?;
    buf.put_slice(&tag);

    Ok(buf.to_vec())
}
