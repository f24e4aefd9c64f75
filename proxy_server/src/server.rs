//! Proxy server: lifecycle and the two relay loops.
//!
//! Model:
//! - L1 owns the loopback listener socket and services the send
//!   direction (client → server). It also creates and replaces the
//!   client session.
//! - L2 (one per session) owns the upstream socket and services the
//!   recv direction (server → client).
//! - A run-wide cancellation token governs everything; each session
//!   gets a child token so replacing a client tears down only its
//!   reader loop.
//!
//! Failure policy: no retry. Every per-datagram failure is logged and
//! the datagram dropped; the session and the run continue.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use proxy_shared::config::ProxyConfig;
use proxy_shared::crypto::{aes_cbc_decrypt, aes_cbc_encrypt};
use proxy_shared::error::{ProxyError, Result};
use proxy_shared::frame;
use proxy_shared::packet::{CaptureRecord, Packet};
use proxy_shared::queue::InjectQueue;

use crate::hooks::{HookSlot, HostHooks, ScriptApi, ScriptRunner, ScriptVerdict};
use crate::session::ClientSession;

/// Datagram buffer size: Ethernet MTU minus IP + UDP headers.
const DATAGRAM_MTU: usize = 1500 - 28;

/// State shared by the lifecycle API, both relay loops, and the script
/// API handle.
pub(crate) struct Shared {
    pub(crate) conf: ProxyConfig,
    pub(crate) hooks: HostHooks,
    pub(crate) running: AtomicBool,
    pub(crate) capturing: AtomicBool,
    pub(crate) session: Mutex<Option<ClientSession>>,
    pub(crate) inject_send: InjectQueue,
    pub(crate) inject_recv: InjectQueue,
    pub(crate) script_on_send: HookSlot,
    pub(crate) script_on_recv: HookSlot,
}

/// Live run state; exists only between `start` and the end of teardown.
struct RunState {
    token: CancellationToken,
    tracker: TaskTracker,
}

/// MITM UDP relay for one downstream client at a time.
///
/// The downstream client is redirected to the loopback endpoint returned
/// by [`ProxyServer::start`]; datagrams are decrypted, run through the
/// interception hooks, re-encrypted, and forwarded to the real server.
pub struct ProxyServer {
    shared: Arc<Shared>,
    run: Mutex<Option<RunState>>,
}

impl ProxyServer {
    pub fn new(conf: ProxyConfig, hooks: HostHooks) -> Self {
        Self {
            shared: Arc::new(Shared {
                conf,
                hooks,
                running: AtomicBool::new(false),
                capturing: AtomicBool::new(false),
                session: Mutex::new(None),
                inject_send: InjectQueue::new(),
                inject_recv: InjectQueue::new(),
                script_on_send: HookSlot::default(),
                script_on_recv: HookSlot::default(),
            }),
            run: Mutex::new(None),
        }
    }

    /// Handle for the scripting collaborator.
    pub fn script_api(&self) -> ScriptApi {
        ScriptApi {
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether a downstream client currently holds the session slot.
    pub fn is_connected(&self) -> bool {
        self.shared.session.lock().unwrap().is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    pub fn set_capturing(&self, on: bool) {
        self.shared.capturing.store(on, Ordering::SeqCst);
    }

    /// Binds the loopback listener, spawns the relay machinery, and
    /// returns the configuration the downstream client should be
    /// redirected to.
    pub async fn start(&self) -> Result<ProxyConfig> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::Config("server is already running".into()));
        }
        match self.start_inner().await {
            Ok(conf) => Ok(conf),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<ProxyConfig> {
        self.shared.conf.validate()?;

        let listener =
            Arc::new(UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?);
        let listen_addr = listener.local_addr()?;
        let mitm_conf = self.shared.conf.mitm_config(listen_addr);

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let runner = Arc::new(ScriptRunner::spawn(
            self.shared.conf.script_timeout(),
            token.clone(),
            &tracker,
        ));

        tracker.spawn(listener_loop(
            self.shared.clone(),
            listener,
            runner,
            token.clone(),
            tracker.clone(),
        ));
        tracker.close();

        *self.run.lock().unwrap() = Some(RunState { token, tracker });

        info!(
            listen = %listen_addr,
            upstream = %self.shared.conf.server_addr,
            "Proxy listening"
        );

        if let (Some(host), Some(src)) = (
            &self.shared.hooks.script_host,
            &self.shared.conf.auto_exec_script,
        ) {
            host.execute(src.as_bytes());
        }

        Ok(mitm_conf)
    }

    /// Trips the cancellation token and waits for every spawned loop to
    /// quiesce. Calling on an idle server is a no-op.
    pub async fn stop(&self) {
        let state = self.run.lock().unwrap().take();
        if let Some(state) = state {
            state.token.cancel();
            state.tracker.wait().await;
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// Dials a fresh UDP socket toward the upstream server.
async fn dial_upstream(addr: SocketAddr) -> Result<UdpSocket> {
    let bind: SocketAddr = match addr {
        SocketAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into(),
        SocketAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into(),
    };
    let sock = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProxyError::SessionSetup(e.to_string()))?;
    sock.connect(addr)
        .await
        .map_err(|e| ProxyError::SessionSetup(e.to_string()))?;
    Ok(sock)
}

/// L1: services the downstream client. Owns the listener socket, drains
/// the send-injection queue, creates/replaces the session, and runs the
/// send-direction pipeline.
async fn listener_loop(
    shared: Arc<Shared>,
    listener: Arc<UdpSocket>,
    runner: Arc<ScriptRunner>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let mut buf = vec![0u8; DATAGRAM_MTU];

    loop {
        if token.is_cancelled() {
            debug!("Got close signal");
            break;
        }

        // At most one injected datagram per iteration, ahead of the
        // natural read. Injection needs a live session to write on.
        let injected = {
            let sess = shared.session.lock().unwrap();
            sess.as_ref()
                .and_then(|s| shared.inject_send.pop().map(|d| (d, s.socket.clone())))
        };
        if let Some((data, upstream_sock)) = injected {
            match aes_cbc_encrypt(&data, &shared.conf.key, &shared.conf.iv) {
                Ok(ct) => {
                    if let Err(e) = upstream_sock.send(&ct).await {
                        error!(error = %e, "Error writing injected send-side packet");
                    }
                }
                Err(e) => error!(error = %e, "Failed to encrypt injected packet"),
            }
            continue;
        }

        let (len, peer) = match time::timeout(
            shared.conf.read_timeout(),
            listener.recv_from(&mut buf),
        )
        .await
        {
            Err(_) => {
                // Read deadline: the only place the inactivity check runs.
                let idle = {
                    let sess = shared.session.lock().unwrap();
                    sess.as_ref()
                        .map(|s| (s.last_sent.elapsed(), s.last_recv.elapsed()))
                };
                if let Some((sent_idle, recv_idle)) = idle {
                    if sent_idle > shared.conf.idle_timeout() {
                        info!(
                            sent_idle_ms = sent_idle.as_millis() as u64,
                            recv_idle_ms = recv_idle.as_millis() as u64,
                            "No packets received from client in a while, closing session"
                        );
                        break;
                    }
                }
                continue;
            }
            Ok(Err(e)) => {
                error!(error = %e, "Error reading packet from listener socket");
                continue;
            }
            Ok(Ok(v)) => v,
        };

        // A new downstream address replaces the existing session.
        {
            let mut sess = shared.session.lock().unwrap();
            if let Some(s) = sess.as_ref() {
                if s.addr != peer {
                    info!(old = %s.addr, new = %peer, "New client address, tearing down old session");
                    s.token.cancel();
                    *sess = None;
                }
            }
        }

        if shared.session.lock().unwrap().is_none() {
            let upstream_sock = match dial_upstream(shared.conf.server_addr).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    // Slot stays empty; the next datagram retries.
                    error!(
                        error = %e,
                        client = %peer,
                        upstream = %shared.conf.server_addr,
                        "Error initializing upstream socket for client"
                    );
                    continue;
                }
            };
            debug!(
                client = %peer,
                local = ?upstream_sock.local_addr().ok(),
                upstream = %shared.conf.server_addr,
                "Opened upstream socket"
            );

            let sess_token = token.child_token();
            *shared.session.lock().unwrap() = Some(ClientSession::new(
                upstream_sock.clone(),
                peer,
                sess_token.clone(),
            ));

            tracker.spawn(upstream_loop(
                shared.clone(),
                listener.clone(),
                upstream_sock,
                peer,
                runner.clone(),
                sess_token,
            ));

            // Fire on_connect after the reader loop is in place.
            if let Some(cb) = &shared.hooks.on_connect {
                cb(peer);
            }
        }

        let upstream_sock = {
            let mut sess = shared.session.lock().unwrap();
            let Some(s) = sess.as_mut() else {
                continue;
            };
            s.last_sent = Instant::now();
            s.socket.clone()
        };

        let pkt = Packet::new(true, peer, shared.conf.server_addr, buf[..len].to_vec());
        let Some(out) = run_pipeline(&shared, &runner, pkt).await else {
            continue;
        };

        if let Err(e) = upstream_sock.send(&out).await {
            error!(
                error = %e,
                client = %peer,
                upstream = %shared.conf.server_addr,
                "Error writing packet to server"
            );
        }
    }

    // Teardown: must complete, everything here is best-effort.
    {
        let mut sess = shared.session.lock().unwrap();
        if let Some(s) = sess.take() {
            s.token.cancel();
        }
    }
    if let Some(cb) = &shared.hooks.on_disconnect {
        cb();
    }
    token.cancel();
    shared.running.store(false, Ordering::SeqCst);
    info!("Proxy listener stopped");
}

/// L2: one per session. Services the recv direction with roles
/// reversed: injection and relayed datagrams go to the downstream
/// client over the listener socket.
async fn upstream_loop(
    shared: Arc<Shared>,
    listener: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
    client_addr: SocketAddr,
    runner: Arc<ScriptRunner>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; DATAGRAM_MTU];

    loop {
        if token.is_cancelled() {
            break;
        }

        if let Some(data) = shared.inject_recv.pop() {
            match aes_cbc_encrypt(&data, &shared.conf.key, &shared.conf.iv) {
                Ok(ct) => {
                    if let Err(e) = listener.send_to(&ct, client_addr).await {
                        error!(error = %e, client = %client_addr, "Error writing injected recv-side packet");
                    }
                }
                Err(e) => error!(error = %e, "Failed to encrypt injected packet"),
            }
            continue;
        }

        let len = match time::timeout(shared.conf.read_timeout(), upstream.recv(&mut buf)).await
        {
            // Inactivity is judged by the listener loop.
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    client = %client_addr,
                    upstream = %shared.conf.server_addr,
                    "Error reading packet from server"
                );
                continue;
            }
            Ok(Ok(len)) => len,
        };

        // The session may have been replaced while we were blocked in
        // the read; a cancelled token means this datagram is not ours
        // to relay.
        if token.is_cancelled() {
            break;
        }

        {
            let mut sess = shared.session.lock().unwrap();
            if let Some(s) = sess.as_mut() {
                s.last_recv = Instant::now();
            }
        }

        let pkt = Packet::new(false, shared.conf.server_addr, client_addr, buf[..len].to_vec());
        let Some(out) = run_pipeline(&shared, &runner, pkt).await else {
            continue;
        };

        if let Err(e) = listener.send_to(&out, client_addr).await {
            error!(error = %e, client = %client_addr, "Error writing packet to client");
        }
    }

    // The upstream socket closes once the session slot and this loop
    // have both released their handles.
    debug!(client = %client_addr, "Upstream reader stopped");
}

/// Per-datagram transform: decrypt → parse/track → script hook →
/// capture → host hook → re-encrypt.
///
/// `None` means the datagram was dropped; every failure path has
/// already been logged.
async fn run_pipeline(shared: &Shared, runner: &ScriptRunner, mut pkt: Packet) -> Option<Vec<u8>> {
    let conf = &shared.conf;
    let direction = if pkt.is_send { "send" } else { "recv" };

    pkt.data = match aes_cbc_decrypt(&pkt.data, &conf.key, &conf.iv) {
        Ok(plain) => plain,
        Err(e) => {
            error!(error = %e, direction, src = %pkt.src_addr, "Failed to decrypt packet");
            return None;
        }
    };

    let parsed = match frame::deserialize(&pkt.data, &conf.hmac_key) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, direction, src = %pkt.src_addr, "Failed to process packet");
            return None;
        }
    };

    {
        let mut sess = shared.session.lock().unwrap();
        if let Some(s) = sess.as_mut() {
            if pkt.is_send {
                s.track_send(&parsed);
            } else {
                s.track_recv(&parsed);
            }
        }
    }

    let script_hook = if pkt.is_send {
        shared.script_on_send.snapshot()
    } else {
        shared.script_on_recv.snapshot()
    };
    if let Some(hook) = script_hook {
        match runner.run(hook, &pkt).await {
            ScriptVerdict::Replace(data) => pkt.data = data,
            ScriptVerdict::Drop => return None,
            ScriptVerdict::Unmodified => {}
        }
    }

    if shared.capturing.load(Ordering::SeqCst) {
        if let Some(cb) = &shared.hooks.on_capture {
            match CaptureRecord::from_packet(&pkt, &conf.hmac_key) {
                Ok(rec) => cb(rec),
                Err(e) => debug!(error = %e, "Skipping capture of unparsable frame"),
            }
        }
    }

    let host_hook = if pkt.is_send {
        shared.hooks.on_send.clone()
    } else {
        shared.hooks.on_recv.clone()
    };
    if let Some(cb) = host_hook {
        match cb(&pkt) {
            Some(data) => pkt.data = data,
            None => return None,
        }
    }

    match aes_cbc_encrypt(&pkt.data, &conf.key, &conf.iv) {
        Ok(ct) => Some(ct),
        Err(e) => {
            error!(error = %e, direction, "Failed to re-encrypt packet");
            None
        }
    }
}
