//! Per-client session state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use proxy_shared::frame::{UnetPacket, UID_LEN, UID_SENTINEL};

/// State for the single downstream client bound to the proxy.
///
/// Guarded by the server's session mutex; both relay loops, the UID
/// tracker, and script session reads all go through that lock.
pub(crate) struct ClientSession {
    /// UDP socket dialed toward the real server.
    pub socket: Arc<UdpSocket>,
    /// Downstream peer address allocated to this session.
    pub addr: SocketAddr,
    pub last_sent: Instant,
    pub last_recv: Instant,
    /// Confirmed 3-byte session UID.
    pub uid: Option<[u8; UID_LEN]>,
    /// Candidate UID seen from the client, not yet ratified upstream.
    pub pending_uid: Option<[u8; UID_LEN]>,
    /// Cancelling this stops the session's upstream reader loop.
    pub token: CancellationToken,
}

impl ClientSession {
    pub fn new(socket: Arc<UdpSocket>, addr: SocketAddr, token: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            socket,
            addr,
            last_sent: now,
            last_recv: now,
            uid: None,
            pending_uid: None,
            token,
        }
    }

    /// Send-direction tracking: the first non-sentinel UID from the
    /// client becomes the pending candidate.
    pub fn track_send(&mut self, pkt: &UnetPacket) {
        if self.uid.is_none() && self.pending_uid.is_none() && pkt.uid != UID_SENTINEL {
            self.pending_uid = Some(pkt.uid);
        }
    }

    /// Recv-direction tracking: the upstream either ratifies the pending
    /// candidate or overrides it; the candidate is consumed either way.
    pub fn track_recv(&mut self, pkt: &UnetPacket) {
        if self.uid.is_some() || pkt.uid == UID_SENTINEL {
            return;
        }
        let Some(pending) = self.pending_uid else {
            return;
        };

        if pkt.uid == pending {
            info!(uid = %hex::encode(pkt.uid), "Session UID confirmed");
            self.uid = Some(pkt.uid);
        } else {
            debug!(
                pending = %hex::encode(pending),
                got = %hex::encode(pkt.uid),
                "Server rejected the pending session UID"
            );
        }
        self.pending_uid = None;
    }

    /// UID a script encode defaults to: confirmed, else pending, else
    /// the sentinel.
    pub fn effective_uid(&self) -> [u8; UID_LEN] {
        self.uid.or(self.pending_uid).unwrap_or(UID_SENTINEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session() -> ClientSession {
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        ClientSession::new(sock, "127.0.0.1:50000".parse().unwrap(), CancellationToken::new())
    }

    fn pkt(uid: [u8; 3]) -> UnetPacket {
        UnetPacket {
            uid,
            payload: vec![0u8; 4],
        }
    }

    #[tokio::test]
    async fn first_nonzero_uid_becomes_pending() {
        let mut s = session().await;
        assert_eq!(s.effective_uid(), UID_SENTINEL);

        s.track_send(&pkt(UID_SENTINEL));
        assert!(s.pending_uid.is_none());

        s.track_send(&pkt(*b"ABC"));
        assert_eq!(s.pending_uid, Some(*b"ABC"));
        assert_eq!(s.effective_uid(), *b"ABC");

        // A second candidate never displaces the first.
        s.track_send(&pkt(*b"DEF"));
        assert_eq!(s.pending_uid, Some(*b"ABC"));
    }

    #[tokio::test]
    async fn matching_upstream_uid_confirms() {
        let mut s = session().await;
        s.track_send(&pkt(*b"ABC"));
        s.track_recv(&pkt(*b"ABC"));

        assert_eq!(s.uid, Some(*b"ABC"));
        assert!(s.pending_uid.is_none());
        assert_eq!(s.effective_uid(), *b"ABC");
    }

    #[tokio::test]
    async fn mismatched_upstream_uid_discards_candidate() {
        let mut s = session().await;
        s.track_send(&pkt(*b"ABC"));
        s.track_recv(&pkt(*b"XYZ"));

        assert!(s.uid.is_none());
        assert!(s.pending_uid.is_none());
        assert_eq!(s.effective_uid(), UID_SENTINEL);
    }

    #[tokio::test]
    async fn recv_without_candidate_is_ignored() {
        let mut s = session().await;
        s.track_recv(&pkt(*b"ABC"));
        assert!(s.uid.is_none());
        assert!(s.pending_uid.is_none());
    }

    #[tokio::test]
    async fn sentinel_recv_keeps_candidate_pending() {
        let mut s = session().await;
        s.track_send(&pkt(*b"ABC"));
        s.track_recv(&pkt(UID_SENTINEL));
        assert_eq!(s.pending_uid, Some(*b"ABC"));
        assert!(s.uid.is_none());
    }

    #[tokio::test]
    async fn confirmed_uid_is_stable() {
        let mut s = session().await;
        s.track_send(&pkt(*b"ABC"));
        s.track_recv(&pkt(*b"ABC"));

        // Later traffic cannot re-enter the pending path.
        s.track_send(&pkt(*b"ZZZ"));
        s.track_recv(&pkt(*b"ZZZ"));
        assert_eq!(s.uid, Some(*b"ABC"));
        assert!(s.pending_uid.is_none());
    }
}
