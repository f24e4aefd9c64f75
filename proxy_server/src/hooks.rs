//! Interception surface: host callbacks, script hooks, and the script
//! API handle.
//!
//! Invocation order per relayed datagram: script hook first, then
//! capture, then host hook. Both hook families follow the same
//! contract: return replacement bytes, or nothing to drop the
//! datagram.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use proxy_shared::error::Result;
use proxy_shared::frame::{self, UnetPacket, UID_LEN, UID_SENTINEL};
use proxy_shared::packet::{CaptureRecord, Packet};

use crate::server::Shared;

/// Fired when a downstream client binds a session.
pub type ConnectFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;
/// Fired when the session or the run ends.
pub type DisconnectFn = Arc<dyn Fn() + Send + Sync>;
/// Per-datagram callback: `None` drops the datagram, `Some` substitutes
/// the payload.
pub type PacketFn = Arc<dyn Fn(&Packet) -> Option<Vec<u8>> + Send + Sync>;
/// Capture egress sink.
pub type CaptureFn = Arc<dyn Fn(CaptureRecord) + Send + Sync>;

/// Optional host-side callbacks, fixed for the lifetime of the server.
#[derive(Clone, Default)]
pub struct HostHooks {
    pub on_connect: Option<ConnectFn>,
    pub on_disconnect: Option<DisconnectFn>,
    pub on_send: Option<PacketFn>,
    pub on_recv: Option<PacketFn>,
    pub on_capture: Option<CaptureFn>,
    /// The embedded scripting runtime, when one is attached.
    pub script_host: Option<Arc<dyn ScriptHost>>,
}

/// Boundary to the embedded scripting runtime. The core only hands it
/// source to run; everything else goes through [`ScriptApi`].
pub trait ScriptHost: Send + Sync {
    /// Fire-and-forget execution of script source on the runtime.
    fn execute(&self, source: &[u8]);
}

/// Per-datagram script callback, same return-or-drop contract as the
/// host hooks. Runs on the script task runner, never on the relay loop.
#[async_trait]
pub trait ScriptHook: Send + Sync {
    async fn on_packet(&self, pkt: &Packet) -> Option<Vec<u8>>;
}

/// What the relay should do after consulting a script hook.
pub(crate) enum ScriptVerdict {
    /// No usable answer (hook errored, timed out, or runner is gone):
    /// the datagram proceeds with its current payload.
    Unmodified,
    Replace(Vec<u8>),
    Drop,
}

struct ScriptJob {
    hook: Arc<dyn ScriptHook>,
    pkt: Packet,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

/// Single-worker task runner for script callbacks.
///
/// At most one task runs at a time; the relay loop blocks on
/// completion, bounded by the configured per-task timeout. A timed-out
/// task is aborted and its datagram proceeds unmodified.
pub(crate) struct ScriptRunner {
    tx: mpsc::Sender<ScriptJob>,
}

impl ScriptRunner {
    /// Spawns the worker on `tracker`; it exits when `token` trips.
    pub fn spawn(timeout: Duration, token: CancellationToken, tracker: &TaskTracker) -> Self {
        let (tx, mut rx) = mpsc::channel::<ScriptJob>(1);
        tracker.spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = token.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                match tokio::time::timeout(timeout, job.hook.on_packet(&job.pkt)).await {
                    Ok(out) => {
                        // Receiver may have given up; nothing to do then.
                        let _ = job.reply.send(out);
                    }
                    Err(_) => {
                        warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            "Script task timed out, packet proceeds unmodified"
                        );
                        // Dropping `reply` signals the relay to move on.
                    }
                }
            }
        });
        Self { tx }
    }

    /// Runs one hook invocation to completion (or abort) and maps the
    /// outcome onto the relay's verdict.
    pub async fn run(&self, hook: Arc<dyn ScriptHook>, pkt: &Packet) -> ScriptVerdict {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = ScriptJob {
            hook,
            pkt: pkt.clone(),
            reply: reply_tx,
        };
        if self.tx.send(job).await.is_err() {
            warn!("Script runner is gone, packet proceeds unmodified");
            return ScriptVerdict::Unmodified;
        }

        // The worker enforces the timeout; a dropped reply means the
        // task was aborted or the run is shutting down.
        match reply_rx.await {
            Ok(Some(data)) => ScriptVerdict::Replace(data),
            Ok(None) => ScriptVerdict::Drop,
            Err(_) => ScriptVerdict::Unmodified,
        }
    }
}

/// Replaceable hook slot: installs swap the whole hook, relay loops
/// snapshot-load before each invocation.
#[derive(Default)]
pub(crate) struct HookSlot(RwLock<Option<Arc<dyn ScriptHook>>>);

impl HookSlot {
    pub fn install(&self, hook: Option<Arc<dyn ScriptHook>>) {
        *self.0.write().unwrap() = hook;
    }

    pub fn snapshot(&self) -> Option<Arc<dyn ScriptHook>> {
        self.0.read().unwrap().clone()
    }
}

/// Read-only snapshot of the configuration and session fields scripts
/// may inspect.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub server_addr: SocketAddr,
    pub ping_addr: SocketAddr,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub hmac_key: Vec<u8>,
    pub session_id: Vec<u8>,
    /// Confirmed session UID, when one exists.
    pub uid: Option<[u8; UID_LEN]>,
}

/// Handle the scripting collaborator drives the proxy through. Cheap to
/// clone; valid across restarts of the same server.
#[derive(Clone)]
pub struct ScriptApi {
    pub(crate) shared: Arc<Shared>,
}

impl ScriptApi {
    /// Queues a plaintext datagram for the send direction. No-op when
    /// the server is not running.
    pub fn inject_send(&self, data: Vec<u8>) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.inject_send.push(data);
        }
    }

    /// Queues a plaintext datagram for the recv direction. No-op when
    /// the server is not running.
    pub fn inject_recv(&self, data: Vec<u8>) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.inject_recv.push(data);
        }
    }

    /// Parses an inner frame with the configured HMAC key.
    pub fn decode(&self, data: &[u8]) -> Result<UnetPacket> {
        frame::deserialize(data, &self.shared.conf.hmac_key)
    }

    /// Builds an inner frame. An absent UID defaults to the session's
    /// confirmed UID, else the pending one, else the sentinel.
    pub fn encode(&self, uid: Option<[u8; UID_LEN]>, payload: &[u8]) -> Result<Vec<u8>> {
        let uid = uid.unwrap_or_else(|| {
            self.shared
                .session
                .lock()
                .unwrap()
                .as_ref()
                .map(|s| s.effective_uid())
                .unwrap_or(UID_SENTINEL)
        });
        frame::serialize(
            &UnetPacket {
                uid,
                payload: payload.to_vec(),
            },
            &self.shared.conf.hmac_key,
        )
    }

    /// Read-only view of the live session; synchronizes on the session
    /// mutex for the UID read.
    pub fn session(&self) -> SessionView {
        let conf = &self.shared.conf;
        let uid = self
            .shared
            .session
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|s| s.uid);
        SessionView {
            server_addr: conf.server_addr,
            ping_addr: conf.ping_addr,
            key: conf.key.clone(),
            iv: conf.iv.clone(),
            hmac_key: conf.hmac_key.clone(),
            session_id: conf.session_id.clone(),
            uid,
        }
    }

    /// Installs (or clears) the script send hook, replacing any
    /// previous one.
    pub fn set_on_send(&self, hook: Option<Arc<dyn ScriptHook>>) {
        self.shared.script_on_send.install(hook);
    }

    /// Installs (or clears) the script recv hook, replacing any
    /// previous one.
    pub fn set_on_recv(&self, hook: Option<Arc<dyn ScriptHook>>) {
        self.shared.script_on_recv.install(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_shared::config::ProxyConfig;

    use crate::server::ProxyServer;

    fn test_conf() -> ProxyConfig {
        ProxyConfig {
            server_addr: "127.0.0.1:7777".parse().unwrap(),
            ping_addr: "127.0.0.1:7778".parse().unwrap(),
            key: vec![1u8; 16],
            iv: vec![2u8; 16],
            hmac_key: b"hooks test key".to_vec(),
            session_id: b"sid".to_vec(),
            auto_exec_script: None,
            read_timeout_ms: 50,
            idle_timeout_ms: 15_000,
            script_timeout_ms: 100,
        }
    }

    fn test_packet() -> Packet {
        Packet::new(
            true,
            "127.0.0.1:1111".parse().unwrap(),
            "127.0.0.1:2222".parse().unwrap(),
            b"data".to_vec(),
        )
    }

    struct FixedHook(Option<Vec<u8>>);

    #[async_trait]
    impl ScriptHook for FixedHook {
        async fn on_packet(&self, _pkt: &Packet) -> Option<Vec<u8>> {
            self.0.clone()
        }
    }

    struct SleepyHook(Duration);

    #[async_trait]
    impl ScriptHook for SleepyHook {
        async fn on_packet(&self, _pkt: &Packet) -> Option<Vec<u8>> {
            tokio::time::sleep(self.0).await;
            Some(b"too late".to_vec())
        }
    }

    #[tokio::test]
    async fn runner_maps_hook_results_to_verdicts() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let runner = ScriptRunner::spawn(Duration::from_millis(200), token.clone(), &tracker);

        let pkt = test_packet();
        match runner.run(Arc::new(FixedHook(Some(b"new".to_vec()))), &pkt).await {
            ScriptVerdict::Replace(d) => assert_eq!(d, b"new"),
            _ => panic!("expected replacement"),
        }
        assert!(matches!(
            runner.run(Arc::new(FixedHook(None)), &pkt).await,
            ScriptVerdict::Drop
        ));

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn runner_aborts_overlong_tasks() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let runner = ScriptRunner::spawn(Duration::from_millis(50), token.clone(), &tracker);

        let pkt = test_packet();
        let started = tokio::time::Instant::now();
        let verdict = runner
            .run(Arc::new(SleepyHook(Duration::from_secs(5))), &pkt)
            .await;
        assert!(matches!(verdict, ScriptVerdict::Unmodified));
        assert!(started.elapsed() < Duration::from_secs(2));

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[test]
    fn hook_slot_replaces_atomically() {
        let slot = HookSlot::default();
        assert!(slot.snapshot().is_none());

        slot.install(Some(Arc::new(FixedHook(None))));
        assert!(slot.snapshot().is_some());

        slot.install(None);
        assert!(slot.snapshot().is_none());
    }

    #[test]
    fn inject_is_noop_while_idle() {
        let server = ProxyServer::new(test_conf(), HostHooks::default());
        let api = server.script_api();

        api.inject_send(b"ignored".to_vec());
        api.inject_recv(b"ignored".to_vec());
        assert!(api.shared.inject_send.is_empty());
        assert!(api.shared.inject_recv.is_empty());
    }

    #[test]
    fn encode_defaults_to_sentinel_without_session() {
        let server = ProxyServer::new(test_conf(), HostHooks::default());
        let api = server.script_api();

        let wire = api.encode(None, b"payload").unwrap();
        let parsed = api.decode(&wire).unwrap();
        assert_eq!(parsed.uid, UID_SENTINEL);
        assert_eq!(parsed.payload, b"payload");

        let wire = api.encode(Some(*b"abc"), b"payload").unwrap();
        assert_eq!(api.decode(&wire).unwrap().uid, *b"abc");
    }

    #[test]
    fn session_view_surfaces_config_verbatim() {
        let conf = test_conf();
        let server = ProxyServer::new(conf.clone(), HostHooks::default());
        let view = server.script_api().session();

        assert_eq!(view.server_addr, conf.server_addr);
        assert_eq!(view.ping_addr, conf.ping_addr);
        assert_eq!(view.key, conf.key);
        assert_eq!(view.iv, conf.iv);
        assert_eq!(view.hmac_key, conf.hmac_key);
        assert_eq!(view.session_id, conf.session_id);
        assert!(view.uid.is_none());
    }
}
