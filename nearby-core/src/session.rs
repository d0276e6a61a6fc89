//! Session facade: local identity, connected-peer registry and inbound FIFO over a transport.
//!
//! Everything mutable sits behind one lock. Transport notifications, dequeues and
//! count reads are serialized through it; transport calls are made with the lock
//! released so a transport may report events from inside `send`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::identity::{LocalIdentity, PeerId};
use crate::transport::{EventReceiver, SendMode, Transport, TransportError, TransportEvent};

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Enabled,
    Disabled,
    Closed,
}

/// One buffered inbound payload and the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Traffic counters since the session was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub peers_connected: u64,
    pub peers_disconnected: u64,
}

struct SessionState {
    lifecycle: Lifecycle,
    peers: BTreeSet<PeerId>,
    inbound: VecDeque<ReceivedMessage>,
    stats: SessionStats,
}

impl SessionState {
    fn ensure_sendable(&self) -> Result<(), SessionError> {
        match self.lifecycle {
            Lifecycle::Enabled => Ok(()),
            Lifecycle::Closed => Err(SessionError::Closed),
            Lifecycle::Created | Lifecycle::Disabled => Err(SessionError::Disabled),
        }
    }
}

/// Facade the application talks to. Share it with the event loop through an `Arc`.
pub struct NearbySession<T: Transport> {
    identity: LocalIdentity,
    transport: T,
    state: Mutex<SessionState>,
    /// Flipped once by `close` to stop `run_events`.
    closed: watch::Sender<bool>,
}

impl<T: Transport> NearbySession<T> {
    /// Validate the name and service type and wrap `transport`. Discovery does not
    /// start until [`set_enabled(true)`](Self::set_enabled).
    pub fn new(name: &str, service: &str, transport: T) -> Result<Self, SessionError> {
        let identity = LocalIdentity::new(name, service)?;
        Ok(Self::with_identity(identity, transport))
    }

    pub fn with_identity(identity: LocalIdentity, transport: T) -> Self {
        Self {
            identity,
            transport,
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Created,
                peers: BTreeSet::new(),
                inbound: VecDeque::new(),
                stats: SessionStats::default(),
            }),
            closed: watch::channel(false).0,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_enabled(&self) -> bool {
        self.lifecycle() == Lifecycle::Enabled
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    /// Start or stop advertising and browsing. Links, the registry and the inbound
    /// queue are untouched by either direction; while disabled, sends are refused.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        match (self.lifecycle(), enabled) {
            (Lifecycle::Closed, _) => return Err(SessionError::Closed),
            (Lifecycle::Enabled, true) => return Ok(()),
            (Lifecycle::Created | Lifecycle::Disabled, false) => return Ok(()),
            _ => {}
        }

        if enabled {
            self.transport.advertise(&self.identity)?;
            if let Err(e) = self.transport.browse(&self.identity.service) {
                self.transport.stop_discovery();
                return Err(e.into());
            }
        } else {
            self.transport.stop_discovery();
        }

        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            drop(state);
            self.transport.stop_discovery();
            return Err(SessionError::Closed);
        }
        state.lifecycle = if enabled {
            Lifecycle::Enabled
        } else {
            Lifecycle::Disabled
        };
        debug!(service = %self.identity.service, enabled, "discovery toggled");
        Ok(())
    }

    /// Send `payload` to every connected peer.
    ///
    /// Each peer is attempted independently; on failure the remaining peers are still
    /// tried and the first error is returned. Sends already issued are not undone.
    pub fn broadcast(&self, payload: &[u8], mode: SendMode) -> Result<(), SessionError> {
        let peers: Vec<PeerId> = {
            let state = self.state.lock();
            state.ensure_sendable()?;
            if state.peers.is_empty() {
                return Err(SessionError::NoConnectedPeers);
            }
            state.peers.iter().copied().collect()
        };
        self.check_payload_len(payload)?;

        let mut first_err = None;
        let mut sent = 0u64;
        for peer in &peers {
            match self.transport.send(*peer, payload, mode) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(%peer, error = %e, "broadcast send failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        trace!(peers = peers.len(), sent, len = payload.len(), ?mode, "broadcast");
        self.record_sent(sent, payload.len(), peers.len() as u64 - sent);

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Send `payload` to one connected peer.
    pub fn send_to(
        &self,
        peer: PeerId,
        payload: &[u8],
        mode: SendMode,
    ) -> Result<(), SessionError> {
        {
            let state = self.state.lock();
            state.ensure_sendable()?;
            if !state.peers.contains(&peer) {
                return Err(SessionError::Transport(TransportError::NotConnected(peer)));
            }
        }
        self.check_payload_len(payload)?;
        match self.transport.send(peer, payload, mode) {
            Ok(()) => {
                self.record_sent(1, payload.len(), 0);
                Ok(())
            }
            Err(e) => {
                self.record_sent(0, payload.len(), 1);
                Err(e.into())
            }
        }
    }

    pub fn connected_peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state.lock().peers.iter().copied().collect()
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// Size of the payload [`dequeue`](Self::dequeue) would return next.
    pub fn peek_len(&self) -> Option<usize> {
        self.state.lock().inbound.front().map(|m| m.payload.len())
    }

    /// Remove and return the oldest buffered payload.
    pub fn dequeue(&self) -> Result<Vec<u8>, SessionError> {
        self.dequeue_message().map(|m| m.payload)
    }

    pub fn dequeue_message(&self) -> Result<ReceivedMessage, SessionError> {
        self.state
            .lock()
            .inbound
            .pop_front()
            .ok_or(SessionError::EmptyQueue)
    }

    pub fn stats(&self) -> SessionStats {
        self.state.lock().stats
    }

    /// Apply one transport notification. Ignored once the session is closed.
    pub fn handle_event(&self, event: TransportEvent) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            trace!(?event, "event after close dropped");
            return;
        }
        match event {
            TransportEvent::PeerConnected(peer) => {
                if state.peers.insert(peer) {
                    state.stats.peers_connected += 1;
                    debug!(%peer, count = state.peers.len(), "peer connected");
                }
            }
            TransportEvent::PeerDisconnected(peer) => {
                if state.peers.remove(&peer) {
                    state.stats.peers_disconnected += 1;
                    debug!(%peer, count = state.peers.len(), "peer disconnected");
                }
            }
            TransportEvent::MessageReceived(from, payload) => {
                state.stats.messages_received += 1;
                state.stats.bytes_received += payload.len() as u64;
                trace!(
                    peer = %from,
                    len = payload.len(),
                    queued = state.inbound.len() + 1,
                    "message received"
                );
                state.inbound.push_back(ReceivedMessage { from, payload });
            }
        }
    }

    /// Apply every notification already waiting on `events` without blocking.
    /// Returns how many were applied.
    pub fn drain_events(&self, events: &mut EventReceiver) -> usize {
        let mut n = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_event(event);
            n += 1;
        }
        n
    }

    /// Event loop: apply notifications in channel order until the channel closes or
    /// the session is closed. Returns promptly on `close` even with no events pending,
    /// releasing its `Arc` so the session and transport can drop.
    pub async fn run_events(self: Arc<Self>, mut events: EventReceiver) {
        let mut closed = self.closed.subscribe();
        while !self.is_closed() {
            let event = tokio::select! {
                biased;
                _ = closed.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event);
        }
        debug!("session event loop finished");
    }

    /// Stop discovery, shut the transport down and drop all buffered state.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
            state.peers.clear();
            state.inbound.clear();
        }
        self.closed.send_replace(true);
        self.transport.stop_discovery();
        self.transport.shutdown();
        debug!(name = %self.identity.name, "session closed");
    }

    fn check_payload_len(&self, payload: &[u8]) -> Result<(), SessionError> {
        let max = self.transport.max_payload_len();
        if payload.len() > max {
            return Err(SessionError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        Ok(())
    }

    fn record_sent(&self, sent: u64, len: usize, failed: u64) {
        let mut state = self.state.lock();
        state.stats.messages_sent += sent;
        state.stats.bytes_sent += sent * len as u64;
        state.stats.send_failures += failed;
    }
}

impl<T: Transport> Drop for NearbySession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServiceType;
    use crate::transport::{event_channel, TransportError};
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Advertise(String, String),
        Browse(String),
        StopDiscovery,
        Send(PeerId, Vec<u8>, SendMode),
        Shutdown,
    }

    /// Records every call; peers in `failing` reject sends.
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        failing: Mutex<HashSet<PeerId>>,
        max_payload: Option<usize>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn sends(&self) -> Vec<PeerId> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Send(p, _, _) => Some(p),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn advertise(&self, identity: &LocalIdentity) -> Result<(), TransportError> {
            self.calls.lock().push(Call::Advertise(
                identity.name.to_string(),
                identity.service.to_string(),
            ));
            Ok(())
        }

        fn browse(&self, service: &ServiceType) -> Result<(), TransportError> {
            self.calls.lock().push(Call::Browse(service.to_string()));
            Ok(())
        }

        fn stop_discovery(&self) {
            self.calls.lock().push(Call::StopDiscovery);
        }

        fn send(&self, peer: PeerId, payload: &[u8], mode: SendMode) -> Result<(), TransportError> {
            self.calls.lock().push(Call::Send(peer, payload.to_vec(), mode));
            if self.failing.lock().contains(&peer) {
                return Err(TransportError::NotConnected(peer));
            }
            Ok(())
        }

        fn max_payload_len(&self) -> usize {
            self.max_payload.unwrap_or(crate::transport::DEFAULT_MAX_PAYLOAD_LEN)
        }

        fn shutdown(&self) {
            self.calls.lock().push(Call::Shutdown);
        }
    }

    fn peer(n: u8) -> PeerId {
        PeerId([n; 16])
    }

    fn enabled_session() -> NearbySession<Arc<RecordingTransport>> {
        let transport = Arc::new(RecordingTransport::default());
        let session = NearbySession::new("A", "svc", transport).unwrap();
        session.set_enabled(true).unwrap();
        session
    }

    #[test]
    fn create_rejects_bad_names() {
        let t = RecordingTransport::default();
        assert!(matches!(
            NearbySession::new("", "svc", t),
            Err(SessionError::InvalidName(_))
        ));
        let t = RecordingTransport::default();
        assert!(matches!(
            NearbySession::new("A", "Not Valid", t),
            Err(SessionError::InvalidName(_))
        ));
    }

    #[test]
    fn connect_broadcast_receive_dequeue() {
        let session = enabled_session();
        let (p1, p2) = (peer(1), peer(2));
        session.handle_event(TransportEvent::PeerConnected(p1));
        session.handle_event(TransportEvent::PeerConnected(p2));
        assert_eq!(session.connected_peer_count(), 2);

        session.broadcast(b"payload", SendMode::Reliable).unwrap();
        let mut sent = session.transport().sends();
        sent.sort();
        assert_eq!(sent, vec![p1, p2]);

        session.handle_event(TransportEvent::MessageReceived(p1, b"hi".to_vec()));
        assert_eq!(session.queue_size(), 1);
        assert_eq!(session.dequeue().unwrap(), b"hi".to_vec());
        assert_eq!(session.queue_size(), 0);
    }

    #[test]
    fn broadcast_without_peers_makes_no_transport_calls() {
        let session = enabled_session();
        assert_eq!(
            session.broadcast(b"x", SendMode::Reliable),
            Err(SessionError::NoConnectedPeers)
        );
        assert!(session.transport().sends().is_empty());
    }

    #[test]
    fn broadcast_reports_first_failure_but_tries_every_peer() {
        let session = enabled_session();
        for n in 1..=3 {
            session.handle_event(TransportEvent::PeerConnected(peer(n)));
        }
        session.transport().failing.lock().insert(peer(2));
        session.transport().failing.lock().insert(peer(3));

        let err = session.broadcast(b"x", SendMode::BestEffort).unwrap_err();
        assert_eq!(
            err,
            SessionError::Transport(TransportError::NotConnected(peer(2)))
        );
        assert_eq!(session.transport().sends(), vec![peer(1), peer(2), peer(3)]);

        let stats = session.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.send_failures, 2);
    }

    #[test]
    fn oversized_payload_rejected_before_any_send() {
        let transport = RecordingTransport {
            max_payload: Some(4),
            ..Default::default()
        };
        let session = NearbySession::new("A", "svc", transport).unwrap();
        session.set_enabled(true).unwrap();
        session.handle_event(TransportEvent::PeerConnected(peer(1)));
        assert_eq!(
            session.broadcast(b"12345", SendMode::Reliable),
            Err(SessionError::PayloadTooLarge { len: 5, max: 4 })
        );
        assert!(session.transport().sends().is_empty());
        session.broadcast(b"1234", SendMode::Reliable).unwrap();
    }

    #[test]
    fn dequeue_empty_leaves_state_unchanged() {
        let session = enabled_session();
        assert_eq!(session.dequeue(), Err(SessionError::EmptyQueue));
        assert_eq!(session.queue_size(), 0);
        assert_eq!(session.peek_len(), None);
    }

    #[test]
    fn fifo_under_interleaving() {
        use rand::Rng;
        let session = enabled_session();
        let mut rng = rand::thread_rng();
        let mut next_in = 0u32;
        let mut next_out = 0u32;
        for _ in 0..500 {
            if rng.gen_bool(0.6) {
                session.handle_event(TransportEvent::MessageReceived(
                    peer((next_in % 3) as u8),
                    next_in.to_le_bytes().to_vec(),
                ));
                next_in += 1;
            } else if next_out < next_in {
                let bytes = session.dequeue().unwrap();
                assert_eq!(bytes, next_out.to_le_bytes().to_vec());
                next_out += 1;
            } else {
                assert_eq!(session.dequeue(), Err(SessionError::EmptyQueue));
            }
            assert_eq!(session.queue_size(), (next_in - next_out) as usize);
        }
    }

    #[test]
    fn peer_count_tracks_connects_minus_disconnects() {
        let session = enabled_session();
        session.handle_event(TransportEvent::PeerConnected(peer(1)));
        session.handle_event(TransportEvent::PeerConnected(peer(2)));
        session.handle_event(TransportEvent::PeerConnected(peer(3)));
        session.handle_event(TransportEvent::PeerDisconnected(peer(2)));
        assert_eq!(session.connected_peer_count(), 2);
        // Unknown peers do not drive the count negative.
        session.handle_event(TransportEvent::PeerDisconnected(peer(9)));
        assert_eq!(session.connected_peer_count(), 2);
        assert_eq!(session.connected_peers(), vec![peer(1), peer(3)]);
    }

    #[test]
    fn enabling_advertises_then_browses() {
        let session = enabled_session();
        assert!(session.is_enabled());
        assert_eq!(
            session.transport().calls(),
            vec![
                Call::Advertise("A".into(), "svc".into()),
                Call::Browse("svc".into()),
            ]
        );
        // Same value again is a no-op.
        session.set_enabled(true).unwrap();
        assert_eq!(session.transport().calls().len(), 2);

        session.set_enabled(false).unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Disabled);
        assert_eq!(session.transport().calls().last(), Some(&Call::StopDiscovery));
    }

    #[test]
    fn disabled_session_refuses_sends_but_keeps_receiving() {
        let session = NearbySession::new("A", "svc", RecordingTransport::default()).unwrap();
        session.handle_event(TransportEvent::PeerConnected(peer(1)));
        assert_eq!(
            session.broadcast(b"x", SendMode::Reliable),
            Err(SessionError::Disabled)
        );

        session.set_enabled(true).unwrap();
        session.set_enabled(false).unwrap();
        session.handle_event(TransportEvent::MessageReceived(peer(1), b"late".to_vec()));
        assert_eq!(session.connected_peer_count(), 1);
        assert_eq!(session.queue_size(), 1);
        assert_eq!(
            session.send_to(peer(1), b"x", SendMode::Reliable),
            Err(SessionError::Disabled)
        );
        assert!(session.transport().sends().is_empty());
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let session = enabled_session();
        session.handle_event(TransportEvent::PeerConnected(peer(1)));
        assert_eq!(
            session.send_to(peer(2), b"x", SendMode::Reliable),
            Err(SessionError::Transport(TransportError::NotConnected(peer(2))))
        );
        session.send_to(peer(1), b"x", SendMode::Reliable).unwrap();
        assert_eq!(session.transport().sends(), vec![peer(1)]);
    }

    #[test]
    fn close_is_terminal() {
        let session = enabled_session();
        session.handle_event(TransportEvent::PeerConnected(peer(1)));
        session.handle_event(TransportEvent::MessageReceived(peer(1), b"a".to_vec()));
        session.close();

        assert_eq!(session.connected_peer_count(), 0);
        assert_eq!(session.queue_size(), 0);
        assert_eq!(session.dequeue(), Err(SessionError::EmptyQueue));
        assert_eq!(
            session.broadcast(b"x", SendMode::Reliable),
            Err(SessionError::Closed)
        );
        assert_eq!(session.set_enabled(true), Err(SessionError::Closed));

        session.handle_event(TransportEvent::PeerConnected(peer(2)));
        session.handle_event(TransportEvent::MessageReceived(peer(2), b"b".to_vec()));
        assert_eq!(session.connected_peer_count(), 0);
        assert_eq!(session.queue_size(), 0);

        let calls = session.transport().calls();
        assert!(calls.ends_with(&[Call::StopDiscovery, Call::Shutdown]));
        // Second close does not touch the transport again.
        session.close();
        assert_eq!(session.transport().calls().len(), calls.len());
    }

    #[test]
    fn drain_events_applies_in_order() {
        let session = enabled_session();
        let (tx, mut rx) = event_channel();
        tx.send(TransportEvent::PeerConnected(peer(1))).unwrap();
        tx.send(TransportEvent::MessageReceived(peer(1), b"1".to_vec())).unwrap();
        tx.send(TransportEvent::MessageReceived(peer(1), b"2".to_vec())).unwrap();
        assert_eq!(session.drain_events(&mut rx), 3);
        assert_eq!(session.drain_events(&mut rx), 0);
        let first = session.dequeue_message().unwrap();
        assert_eq!(first.from, peer(1));
        assert_eq!(first.payload, b"1".to_vec());
        assert_eq!(session.dequeue().unwrap(), b"2".to_vec());
    }

    #[tokio::test]
    async fn event_loop_runs_until_channel_closes() {
        let session = Arc::new(enabled_session());
        let (tx, rx) = event_channel();
        let task = tokio::spawn(session.clone().run_events(rx));
        tx.send(TransportEvent::PeerConnected(peer(1))).unwrap();
        tx.send(TransportEvent::MessageReceived(peer(1), b"hi".to_vec())).unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(session.connected_peer_count(), 1);
        assert_eq!(session.dequeue().unwrap(), b"hi".to_vec());
    }

    #[tokio::test]
    async fn close_stops_idle_event_loop() {
        let session = Arc::new(enabled_session());
        // Sender stays alive, as it does inside a transport the session owns.
        let (_tx, rx) = event_channel();
        let task = tokio::spawn(session.clone().run_events(rx));
        tokio::task::yield_now().await;

        session.close();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("event loop still running after close")
            .unwrap();
        assert_eq!(Arc::strong_count(&session), 1);
    }

    #[tokio::test]
    async fn event_loop_started_after_close_returns_at_once() {
        let session = Arc::new(enabled_session());
        session.close();
        let (_tx, rx) = event_channel();
        session.clone().run_events(rx).await;
    }

    #[test]
    fn concurrent_producers_keep_per_peer_order() {
        let session = Arc::new(enabled_session());
        let handles: Vec<_> = (0..4u8)
            .map(|p| {
                let s = session.clone();
                std::thread::spawn(move || {
                    for i in 0..250u32 {
                        let payload = i.to_le_bytes().to_vec();
                        s.handle_event(TransportEvent::MessageReceived(peer(p), payload));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(session.queue_size(), 1000);
        let mut last = [None::<u32>; 4];
        while let Ok(msg) = session.dequeue_message() {
            let i = u32::from_le_bytes(msg.payload.try_into().unwrap());
            let slot = &mut last[msg.from.0[0] as usize];
            assert!(slot.map_or(true, |prev| prev < i));
            *slot = Some(i);
        }
    }
}
