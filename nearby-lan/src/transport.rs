//! Local links: TCP listener (incoming), TCP dialer (discovered or explicit peers),
//! Hello handshake, then encrypted length-prefixed frames.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::crypto::{derive_session_key, direction_key, FrameCipher};
use nearby_core::wire::{
    decode_body, encode_body, encode_frame, frame_bytes, LEN_SIZE, MAX_FRAME_LEN,
};
use nearby_core::{
    event_channel, EventReceiver, EventSender, Keypair, LocalIdentity, Message, PeerId, SendMode,
    ServiceType, Transport, TransportError, TransportEvent, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::discovery::{self, Advertisement, Discovered, DiscoveryMode, DiscoveryTask, LocalPeer};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Link transport settings.
#[derive(Debug, Clone)]
pub struct LanOptions {
    pub service: ServiceType,
    pub bind_addr: IpAddr,
    pub transport_port: u16,
    pub discovery_port: u16,
    pub beacon_interval: Duration,
    pub peer_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_payload_len: usize,
    pub best_effort_queue: usize,
}

impl LanOptions {
    pub fn from_config(config: &Config) -> Result<Self, nearby_core::NameError> {
        Ok(Self {
            service: ServiceType::new(config.service_type.clone())?,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            transport_port: config.transport_port,
            discovery_port: config.discovery_port,
            beacon_interval: config.beacon_interval(),
            peer_timeout: config.peer_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            max_payload_len: config.max_payload_len,
            best_effort_queue: config.best_effort_queue.max(1),
        })
    }
}

enum Outbound {
    Data(SendMode, Vec<u8>),
    Leave,
}

struct LinkHandle {
    conn_id: u64,
    /// Which side dialed this link; decides which of two duplicate links survives.
    dialer: PeerId,
    reliable: mpsc::UnboundedSender<Outbound>,
    best_effort: mpsc::Sender<Outbound>,
}

struct Shared {
    keypair: Keypair,
    options: LanOptions,
    local_addr: SocketAddr,
    events: EventSender,
    links: Mutex<HashMap<PeerId, LinkHandle>>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
    discovery_mode: watch::Sender<DiscoveryMode>,
    discovery_started: AtomicBool,
    dial_tx: mpsc::UnboundedSender<Discovered>,
    shutdown: watch::Sender<bool>,
}

/// Transport over the local network. Must be started inside a tokio runtime; the
/// runtime keeps driving its tasks after `start` returns.
pub struct LanTransport {
    shared: Arc<Shared>,
    runtime: tokio::runtime::Handle,
}

impl LanTransport {
    /// Bind the link listener and start accepting. Discovery starts on the first
    /// `advertise` or `browse`.
    pub async fn start(options: LanOptions) -> std::io::Result<(LanTransport, EventReceiver)> {
        let listener = TcpListener::bind((options.bind_addr, options.transport_port)).await?;
        let local_addr = listener.local_addr()?;
        let (events, events_rx) = event_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (discovery_mode, _) = watch::channel(DiscoveryMode::default());
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            keypair: Keypair::generate(),
            options,
            local_addr,
            events,
            links: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            discovery_mode,
            discovery_started: AtomicBool::new(false),
            dial_tx,
            shutdown,
        });
        debug!(peer = %shared.keypair.peer_id(), addr = %local_addr, "link listener bound");

        // Subscribe before spawning so a shutdown right after `start` is not missed.
        tokio::spawn(accept_loop(shared.clone(), listener, shared.shutdown.subscribe()));
        tokio::spawn(dial_loop(shared.clone(), dial_rx, shared.shutdown.subscribe()));

        let transport = LanTransport {
            shared,
            runtime: tokio::runtime::Handle::current(),
        };
        Ok((transport, events_rx))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.shared.keypair.peer_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_linked(&self, peer: PeerId) -> bool {
        self.shared.links.lock().contains_key(&peer)
    }

    /// Dial `addr` directly, bypassing discovery. Resolves once the handshake is done.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        dial(self.shared.clone(), addr).await
    }

    fn update_discovery(&self, f: impl FnOnce(&mut DiscoveryMode)) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.shared.discovery_mode.send_modify(f);
        if self.shared.discovery_mode.borrow().is_idle() {
            return Ok(());
        }
        if self.shared.discovery_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let socket = match discovery::bind_multicast(self.shared.options.discovery_port) {
            Ok(s) => s,
            Err(e) => {
                self.shared.discovery_started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let task = DiscoveryTask {
            socket,
            local: LocalPeer {
                peer_id: self.shared.keypair.peer_id(),
                public_key: self.shared.keypair.public_key().clone(),
                listen_port: self.shared.local_addr.port(),
            },
            discovery_port: self.shared.options.discovery_port,
            beacon_interval: self.shared.options.beacon_interval,
            redial_after: self.shared.options.peer_timeout,
            mode: self.shared.discovery_mode.subscribe(),
            dial_tx: self.shared.dial_tx.clone(),
            shutdown: self.shared.shutdown.subscribe(),
        };
        self.spawn_discovery(task.run());
        Ok(())
    }

    /// Run discovery until it ends, then clear `discovery_started` so the next
    /// `advertise` or `browse` binds a fresh socket.
    fn spawn_discovery(&self, run: impl Future<Output = std::io::Result<()>> + Send + 'static) {
        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            if let Err(e) = run.await {
                warn!(error = %e, "discovery failed");
            }
            shared.discovery_started.store(false, Ordering::SeqCst);
        });
    }

    /// Mark discovery as running without binding the multicast socket.
    #[cfg(test)]
    pub(crate) fn skip_multicast(&self) {
        self.shared.discovery_started.store(true, Ordering::SeqCst);
    }

    fn check_service(&self, service: &ServiceType) -> Result<(), TransportError> {
        if *service != self.shared.options.service {
            return Err(TransportError::Io(format!(
                "service type {service} does not match transport service {}",
                self.shared.options.service
            )));
        }
        Ok(())
    }
}

impl Transport for LanTransport {
    fn advertise(&self, identity: &LocalIdentity) -> Result<(), TransportError> {
        self.check_service(&identity.service)?;
        let ad = Advertisement {
            service_type: identity.service.to_string(),
            display_name: identity.name.to_string(),
        };
        self.update_discovery(|m| m.advertise = Some(ad))
    }

    fn browse(&self, service: &ServiceType) -> Result<(), TransportError> {
        self.check_service(service)?;
        let service = service.to_string();
        self.update_discovery(|m| m.browse = Some(service))
    }

    fn stop_discovery(&self) {
        self.shared.discovery_mode.send_modify(|m| *m = DiscoveryMode::default());
    }

    fn send(&self, peer: PeerId, payload: &[u8], mode: SendMode) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let max = self.shared.options.max_payload_len;
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        let links = self.shared.links.lock();
        let link = links.get(&peer).ok_or(TransportError::NotConnected(peer))?;
        let out = Outbound::Data(mode, payload.to_vec());
        match mode {
            SendMode::Reliable => link
                .reliable
                .send(out)
                .map_err(|_| TransportError::NotConnected(peer)),
            SendMode::BestEffort => match link.best_effort.try_send(out) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(%peer, "best-effort queue full, payload dropped");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(TransportError::NotConnected(peer))
                }
            },
        }
    }

    fn max_payload_len(&self) -> usize {
        self.shared.options.max_payload_len
    }

    fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_discovery();
        self.shared.shutdown.send_replace(true);
        let mut links = self.shared.links.lock();
        for (peer, link) in links.drain() {
            let _ = link.reliable.send(Outbound::Leave);
            let _ = self.shared.events.send(TransportEvent::PeerDisconnected(peer));
        }
        debug!("lan transport shut down");
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, from) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    match handshake(&shared, stream, false).await {
                        Ok((peer, _)) => trace!(%peer, %from, "inbound link established"),
                        Err(e) => debug!(%from, error = %e, "inbound handshake rejected"),
                    }
                });
            }
        }
    }
}

async fn dial_loop(
    shared: Arc<Shared>,
    mut dial_rx: mpsc::UnboundedReceiver<Discovered>,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }
    loop {
        let found = tokio::select! {
            _ = shutdown.changed() => break,
            found = dial_rx.recv() => match found {
                Some(f) => f,
                None => break,
            },
        };
        if shared.links.lock().contains_key(&found.peer_id) {
            continue;
        }
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = dial(shared, found.addr).await {
                debug!(peer = %found.peer_id, addr = %found.addr, error = %e, "dial failed");
            }
        });
    }
}

async fn dial(shared: Arc<Shared>, addr: SocketAddr) -> Result<PeerId, TransportError> {
    if shared.closed.load(Ordering::SeqCst) {
        return Err(TransportError::Closed);
    }
    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Io(format!("connect to {addr} timed out")))??;
    let (peer, active) = handshake(&shared, stream, true).await?;
    if !active {
        trace!(%peer, "dialed link superseded by existing link");
    }
    Ok(peer)
}

/// Exchange Hello frames, derive the link key and hand the stream to its tasks.
/// Returns the remote peer and whether this link became the active one.
async fn handshake(
    shared: &Arc<Shared>,
    mut stream: TcpStream,
    dialed: bool,
) -> Result<(PeerId, bool), TransportError> {
    let local_id = shared.keypair.peer_id();
    let hello = encode_frame(&Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        peer_id: local_id,
        public_key: shared.keypair.public_key().clone(),
        service_type: shared.options.service.to_string(),
    })
    .map_err(|e| TransportError::Io(e.to_string()))?;

    let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        stream.write_all(&hello).await?;
        stream.flush().await?;
        let body = read_frame(&mut stream).await?;
        Ok::<_, TransportError>(body)
    })
    .await
    .map_err(|_| TransportError::Io("handshake timed out".into()))??;

    let hello = decode_body(&remote).map_err(|e| TransportError::Io(e.to_string()))?;
    let (peer, public_key) = match hello {
        Message::Hello {
            protocol_version,
            peer_id,
            public_key,
            service_type,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(TransportError::Io(format!(
                    "unsupported protocol version {protocol_version}"
                )));
            }
            if service_type != shared.options.service.as_str() {
                return Err(TransportError::Io(format!(
                    "peer serves {service_type}, not {}",
                    shared.options.service
                )));
            }
            if PeerId::from_public_key(&public_key) != peer_id || peer_id == local_id {
                return Err(TransportError::Io("peer id does not match its key".into()));
            }
            (peer_id, public_key)
        }
        _ => return Err(TransportError::Io("expected Hello".into())),
    };

    let key = derive_session_key(&shared.keypair.shared_secret(&public_key));
    let dialer = if dialed { local_id } else { peer };
    let active = spawn_link(shared.clone(), stream, peer, dialer, key);
    Ok((peer, active))
}

/// Register the link and start its reader and writer. Returns false if an existing
/// link to the same peer wins and this stream is dropped instead.
fn spawn_link(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: PeerId,
    dialer: PeerId,
    key: [u8; 32],
) -> bool {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
    let (best_effort_tx, best_effort_rx) = mpsc::channel(shared.options.best_effort_queue);
    let handle = LinkHandle {
        conn_id,
        dialer,
        reliable: reliable_tx,
        best_effort: best_effort_tx,
    };
    let shutdown = shared.shutdown.subscribe();
    if !register_link(&shared, peer, handle) {
        return false;
    }

    let (reader, writer) = stream.into_split();
    let local_id = shared.keypair.peer_id();
    tokio::spawn(write_loop(
        writer,
        FrameCipher::new(direction_key(&key, local_id)),
        reliable_rx,
        best_effort_rx,
        shared.options.heartbeat_interval,
    ));
    tokio::spawn(async move {
        let cipher = FrameCipher::new(direction_key(&key, peer));
        read_loop(&shared, reader, cipher, peer, shutdown).await;
        unregister_link(&shared, peer, conn_id);
    });
    true
}

/// Both ends apply the same rule, so both keep the same TCP connection: the link
/// dialed by the smaller peer ID wins.
fn register_link(shared: &Shared, peer: PeerId, handle: LinkHandle) -> bool {
    let preferred_dialer = shared.keypair.peer_id().min(peer);
    let mut links = shared.links.lock();
    // Checked under the lock: `shutdown` drains the map after setting the flag.
    if shared.closed.load(Ordering::SeqCst) {
        return false;
    }
    match links.get(&peer) {
        None => {
            links.insert(peer, handle);
            let _ = shared.events.send(TransportEvent::PeerConnected(peer));
            debug!(%peer, "link up");
            true
        }
        Some(existing)
            if existing.dialer == preferred_dialer && handle.dialer != preferred_dialer =>
        {
            false
        }
        Some(_) => {
            // Replaces the older link without a connect/disconnect pair; the old
            // writer closes once its channels drop.
            links.insert(peer, handle);
            trace!(%peer, "link replaced");
            true
        }
    }
}

fn unregister_link(shared: &Shared, peer: PeerId, conn_id: u64) {
    let mut links = shared.links.lock();
    if links.get(&peer).map(|l| l.conn_id) == Some(conn_id) {
        links.remove(&peer);
        let _ = shared.events.send(TransportEvent::PeerDisconnected(peer));
        debug!(%peer, "link down");
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Io(format!("frame of {len} bytes too large")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &mut FrameCipher,
    msg: &Message,
) -> Result<(), TransportError> {
    let body = encode_body(msg).map_err(|e| TransportError::Io(e.to_string()))?;
    let sealed = cipher.seal(&body).map_err(|e| TransportError::Io(e.to_string()))?;
    let frame = frame_bytes(&sealed).map_err(|e| TransportError::Io(e.to_string()))?;
    writer.write_all(&frame).await?;
    Ok(())
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut cipher: FrameCipher,
    mut reliable: mpsc::UnboundedReceiver<Outbound>,
    mut best_effort: mpsc::Receiver<Outbound>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    loop {
        let next = tokio::select! {
            biased;
            out = reliable.recv() => match out {
                Some(out) => out,
                None => break,
            },
            out = best_effort.recv() => match out {
                Some(out) => out,
                None => break,
            },
            _ = heartbeat.tick() => {
                if write_message(&mut writer, &mut cipher, &Message::Heartbeat).await.is_err() {
                    break;
                }
                continue;
            }
        };
        let (msg, leaving) = match next {
            Outbound::Data(mode, payload) => (Message::Data { mode, payload }, false),
            Outbound::Leave => (Message::Leave, true),
        };
        if write_message(&mut writer, &mut cipher, &msg).await.is_err() || leaving {
            break;
        }
        // Only flush when nothing else is queued.
        if reliable.is_empty() && best_effort.is_empty() && writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    shared: &Shared,
    mut reader: R,
    mut cipher: FrameCipher,
    peer: PeerId,
    mut shutdown: watch::Receiver<bool>,
) {
    let timeout = shared.options.peer_timeout;
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = tokio::time::timeout(timeout, read_frame(&mut reader)) => frame,
        };
        let body = match frame {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                trace!(%peer, error = %e, "link read ended");
                break;
            }
            Err(_) => {
                debug!(%peer, "link silent past timeout");
                break;
            }
        };
        let plain = match cipher.open(&body) {
            Ok(p) => p,
            Err(e) => {
                warn!(%peer, error = %e, "dropping link after bad frame");
                break;
            }
        };
        match decode_body(&plain) {
            Ok(Message::Data { payload, .. }) => {
                let _ = shared.events.send(TransportEvent::MessageReceived(peer, payload));
            }
            Ok(Message::Heartbeat) => {}
            Ok(Message::Leave) => {
                debug!(%peer, "peer left");
                break;
            }
            Ok(other) => trace!(%peer, ?other, "unexpected message on link"),
            Err(e) => {
                warn!(%peer, error = %e, "dropping link after undecodable frame");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::NearbySession;

    fn options(service: &str) -> LanOptions {
        LanOptions {
            service: ServiceType::new(service).unwrap(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            transport_port: 0,
            discovery_port: 0,
            beacon_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            max_payload_len: 1024,
            best_effort_queue: 4,
        }
    }

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn direct_link_carries_data_both_ways() {
        let (a, mut a_rx) = LanTransport::start(options("svc")).await.unwrap();
        let (b, mut b_rx) = LanTransport::start(options("svc")).await.unwrap();

        let peer = a.connect(b.local_addr()).await.unwrap();
        assert_eq!(peer, b.local_peer_id());
        assert_eq!(next_event(&mut a_rx).await, TransportEvent::PeerConnected(b.local_peer_id()));
        assert_eq!(next_event(&mut b_rx).await, TransportEvent::PeerConnected(a.local_peer_id()));

        a.send(b.local_peer_id(), b"ping", SendMode::Reliable).unwrap();
        assert_eq!(
            next_event(&mut b_rx).await,
            TransportEvent::MessageReceived(a.local_peer_id(), b"ping".to_vec())
        );
        b.send(a.local_peer_id(), b"pong", SendMode::BestEffort).unwrap();
        assert_eq!(
            next_event(&mut a_rx).await,
            TransportEvent::MessageReceived(b.local_peer_id(), b"pong".to_vec())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reliable_sends_arrive_in_order() {
        let (a, mut a_rx) = LanTransport::start(options("svc")).await.unwrap();
        let (b, mut b_rx) = LanTransport::start(options("svc")).await.unwrap();
        a.connect(b.local_addr()).await.unwrap();
        next_event(&mut a_rx).await;
        next_event(&mut b_rx).await;

        for i in 0..100u32 {
            a.send(b.local_peer_id(), &i.to_le_bytes(), SendMode::Reliable).unwrap();
        }
        for i in 0..100u32 {
            assert_eq!(
                next_event(&mut b_rx).await,
                TransportEvent::MessageReceived(a.local_peer_id(), i.to_le_bytes().to_vec())
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mismatched_service_rejected() {
        let (a, _a_rx) = LanTransport::start(options("svc")).await.unwrap();
        let (b, _b_rx) = LanTransport::start(options("other")).await.unwrap();
        assert!(a.connect(b.local_addr()).await.is_err());
        assert!(!a.is_linked(b.local_peer_id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_reports_disconnect_on_both_sides() {
        let (a, mut a_rx) = LanTransport::start(options("svc")).await.unwrap();
        let (b, mut b_rx) = LanTransport::start(options("svc")).await.unwrap();
        a.connect(b.local_addr()).await.unwrap();
        next_event(&mut a_rx).await;
        next_event(&mut b_rx).await;

        a.shutdown();
        let (a_id, b_id) = (a.local_peer_id(), b.local_peer_id());
        assert_eq!(next_event(&mut a_rx).await, TransportEvent::PeerDisconnected(b_id));
        assert_eq!(next_event(&mut b_rx).await, TransportEvent::PeerDisconnected(a_id));
        assert_eq!(
            a.send(b.local_peer_id(), b"x", SendMode::Reliable),
            Err(TransportError::Closed)
        );
        assert_eq!(
            b.send(a.local_peer_id(), b"x", SendMode::Reliable),
            Err(TransportError::NotConnected(a.local_peer_id()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_dials_keep_one_link() {
        let (a, mut a_rx) = LanTransport::start(options("svc")).await.unwrap();
        let (b, mut b_rx) = LanTransport::start(options("svc")).await.unwrap();
        let (ra, rb) = tokio::join!(a.connect(b.local_addr()), b.connect(a.local_addr()));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(next_event(&mut a_rx).await, TransportEvent::PeerConnected(b.local_peer_id()));
        assert_eq!(next_event(&mut b_rx).await, TransportEvent::PeerConnected(a.local_peer_id()));
        wait_for(|| a.is_linked(b.local_peer_id()) && b.is_linked(a.local_peer_id())).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The surviving link carries data; a losing link may bounce the peer once first.
        a.send(b.local_peer_id(), b"after", SendMode::Reliable).unwrap();
        loop {
            match next_event(&mut b_rx).await {
                TransportEvent::MessageReceived(from, payload) => {
                    assert_eq!(from, a.local_peer_id());
                    assert_eq!(payload, b"after".to_vec());
                    break;
                }
                _ => continue,
            }
        }
        assert!(a.is_linked(b.local_peer_id()));
        assert!(b.is_linked(a.local_peer_id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_payload_rejected() {
        let (a, _rx) = LanTransport::start(options("svc")).await.unwrap();
        assert_eq!(
            a.send(PeerId([1; 16]), &[0u8; 2048], SendMode::Reliable),
            Err(TransportError::PayloadTooLarge { len: 2048, max: 1024 })
        );
        assert_eq!(
            a.send(PeerId([1; 16]), b"x", SendMode::Reliable),
            Err(TransportError::NotConnected(PeerId([1; 16])))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sessions_over_lan_links() {
        let (ta, a_rx) = LanTransport::start(options("svc")).await.unwrap();
        let (tb, b_rx) = LanTransport::start(options("svc")).await.unwrap();
        let b_addr = tb.local_addr();
        let a = Arc::new(NearbySession::new("A", "svc", ta).unwrap());
        let b = Arc::new(NearbySession::new("B", "svc", tb).unwrap());
        tokio::spawn(a.clone().run_events(a_rx));
        tokio::spawn(b.clone().run_events(b_rx));

        a.transport().connect(b_addr).await.unwrap();
        wait_for(|| a.connected_peer_count() == 1 && b.connected_peer_count() == 1).await;

        // Disabled sessions refuse to send; enabling is not needed to hold links.
        assert_eq!(
            a.broadcast(b"hi", SendMode::Reliable),
            Err(nearby_core::SessionError::Disabled)
        );
        force_enabled(&a);

        a.broadcast(b"hi", SendMode::Reliable).unwrap();
        wait_for(|| b.queue_size() == 1).await;
        assert_eq!(b.dequeue().unwrap(), b"hi".to_vec());
        assert_eq!(b.queue_size(), 0);
    }

    fn force_enabled(session: &NearbySession<LanTransport>) {
        session.transport().skip_multicast();
        session.set_enabled(true).unwrap();
    }

    #[tokio::test]
    async fn shutdown_right_after_start_stops_listener() {
        let (t, _rx) = LanTransport::start(options("svc")).await.unwrap();
        let addr = t.local_addr();
        t.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(TcpStream::connect(addr).await.is_err());
        // Accept and dial loops are gone and hold no state.
        assert_eq!(Arc::strong_count(&t.shared), 1);
    }

    #[tokio::test]
    async fn discovery_restarts_after_task_ends() {
        let (t, _rx) = LanTransport::start(options("svc")).await.unwrap();
        t.shared.discovery_started.store(true, Ordering::SeqCst);
        t.spawn_discovery(async {
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
        });
        wait_for(|| !t.shared.discovery_started.load(Ordering::SeqCst)).await;

        // The next advertise binds again instead of assuming a live task.
        let identity = LocalIdentity::new("A", "svc").unwrap();
        let rebound = t.advertise(&identity).is_ok();
        assert_eq!(t.shared.discovery_started.load(Ordering::SeqCst), rebound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closing_lan_session_ends_its_event_loop() {
        let (t, rx) = LanTransport::start(options("svc")).await.unwrap();
        let shared = Arc::downgrade(&t.shared);
        let session = Arc::new(NearbySession::new("A", "svc", t).unwrap());
        let task = tokio::spawn(session.clone().run_events(rx));

        session.close();
        drop(session);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("event loop still running after close")
            .unwrap();
        wait_for(|| shared.upgrade().is_none()).await;
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }
}
