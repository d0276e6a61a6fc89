//! In-process transport: endpoints on a shared hub link when one browses for a
//! service another advertises. Useful for tests and for wiring sessions together
//! inside one process.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::identity::{LocalIdentity, PeerId, ServiceType};
use crate::transport::{
    event_channel, EventReceiver, EventSender, SendMode, Transport, TransportError, TransportEvent,
    DEFAULT_MAX_PAYLOAD_LEN,
};

struct Endpoint {
    events: EventSender,
    advertising: Option<ServiceType>,
    browsing: Option<ServiceType>,
    links: BTreeSet<PeerId>,
    closed: bool,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerId, Endpoint>,
}

impl HubState {
    /// Link every (browser, advertiser) pair with matching service that is not yet linked.
    fn link_matching(&mut self) {
        let mut new_links = Vec::new();
        for (&browser, b) in &self.endpoints {
            let Some(wanted) = b.browsing.as_ref() else {
                continue;
            };
            for (&advertiser, a) in &self.endpoints {
                if advertiser == browser || b.links.contains(&advertiser) {
                    continue;
                }
                if a.advertising.as_ref() == Some(wanted) {
                    let pair = (browser.min(advertiser), browser.max(advertiser));
                    if !new_links.contains(&pair) {
                        new_links.push(pair);
                    }
                }
            }
        }
        for (x, y) in new_links {
            self.link(x, y);
        }
    }

    fn link(&mut self, x: PeerId, y: PeerId) {
        for (me, other) in [(x, y), (y, x)] {
            if let Some(ep) = self.endpoints.get_mut(&me) {
                ep.links.insert(other);
                let _ = ep.events.send(TransportEvent::PeerConnected(other));
            }
        }
        debug!(a = %x, b = %y, "memory link up");
    }

    fn unlink(&mut self, x: PeerId, y: PeerId) -> bool {
        let mut was_linked = false;
        for (me, other) in [(x, y), (y, x)] {
            if let Some(ep) = self.endpoints.get_mut(&me) {
                if ep.links.remove(&other) {
                    was_linked = true;
                    let _ = ep.events.send(TransportEvent::PeerDisconnected(other));
                }
            }
        }
        was_linked
    }
}

/// Shared medium for [`MemoryTransport`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint with a random peer ID.
    pub fn endpoint(&self) -> (MemoryTransport, EventReceiver) {
        self.endpoint_with_id(PeerId::random())
    }

    pub fn endpoint_with_id(&self, peer_id: PeerId) -> (MemoryTransport, EventReceiver) {
        let (tx, rx) = event_channel();
        self.state.lock().endpoints.insert(
            peer_id,
            Endpoint {
                events: tx,
                advertising: None,
                browsing: None,
                links: BTreeSet::new(),
                closed: false,
            },
        );
        let transport = MemoryTransport {
            hub: self.clone(),
            local: peer_id,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        };
        (transport, rx)
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    local: PeerId,
    max_payload_len: usize,
}

impl MemoryTransport {
    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    pub fn set_max_payload_len(&mut self, max: usize) {
        self.max_payload_len = max;
    }

    /// Drop the link to `peer`, reporting a disconnect on both sides.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.hub.state.lock().unlink(self.local, peer)
    }

    fn with_endpoint<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> Result<R, TransportError> {
        let mut state = self.hub.state.lock();
        match state.endpoints.get_mut(&self.local) {
            Some(ep) if !ep.closed => Ok(f(ep)),
            _ => Err(TransportError::Closed),
        }
    }
}

impl Transport for MemoryTransport {
    fn advertise(&self, identity: &LocalIdentity) -> Result<(), TransportError> {
        self.with_endpoint(|ep| ep.advertising = Some(identity.service.clone()))?;
        self.hub.state.lock().link_matching();
        Ok(())
    }

    fn browse(&self, service: &ServiceType) -> Result<(), TransportError> {
        self.with_endpoint(|ep| ep.browsing = Some(service.clone()))?;
        self.hub.state.lock().link_matching();
        Ok(())
    }

    fn stop_discovery(&self) {
        let _ = self.with_endpoint(|ep| {
            ep.advertising = None;
            ep.browsing = None;
        });
    }

    fn send(&self, peer: PeerId, payload: &[u8], _mode: SendMode) -> Result<(), TransportError> {
        if payload.len() > self.max_payload_len {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload_len,
            });
        }
        let state = self.hub.state.lock();
        let linked = state
            .endpoints
            .get(&self.local)
            .map_or(false, |ep| !ep.closed && ep.links.contains(&peer));
        if !linked {
            return Err(TransportError::NotConnected(peer));
        }
        let target = state
            .endpoints
            .get(&peer)
            .ok_or(TransportError::NotConnected(peer))?;
        target
            .events
            .send(TransportEvent::MessageReceived(self.local, payload.to_vec()))
            .map_err(|_| TransportError::NotConnected(peer))
    }

    fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    fn shutdown(&self) {
        let mut state = self.hub.state.lock();
        let links: Vec<PeerId> = match state.endpoints.get_mut(&self.local) {
            Some(ep) if !ep.closed => {
                ep.closed = true;
                ep.advertising = None;
                ep.browsing = None;
                ep.links.iter().copied().collect()
            }
            _ => return,
        };
        for peer in links {
            state.unlink(self.local, peer);
        }
        state.endpoints.remove(&self.local);
    }
}
