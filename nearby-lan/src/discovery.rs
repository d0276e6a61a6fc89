//! LAN discovery: UDP multicast beacons while advertising, dial requests while browsing.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use nearby_core::wire::{decode_frame, encode_frame};
use nearby_core::{Message, PeerId, PublicKey, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);

/// What discovery is currently doing. Both halves may be active at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryMode {
    pub advertise: Option<Advertisement>,
    /// Service type being browsed for.
    pub browse: Option<String>,
}

impl DiscoveryMode {
    pub fn is_idle(&self) -> bool {
        self.advertise.is_none() && self.browse.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service_type: String,
    pub display_name: String,
}

/// Browsing result handed to the link layer for dialing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub peer_id: PeerId,
    pub display_name: String,
    pub addr: SocketAddr,
}

/// What we put in our own beacons.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub listen_port: u16,
}

/// Reaction to one received discovery datagram.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reaction {
    Ignore,
    /// A browsable peer; optionally answer its beacon too.
    Found { peer: Discovered, reply: bool },
    /// Not browsing for it, but it is looking for a service we advertise.
    Reply,
}

pub(crate) fn react(
    msg: &Message,
    from: SocketAddr,
    local: &LocalPeer,
    mode: &DiscoveryMode,
) -> Reaction {
    let is_beacon = matches!(msg, Message::Beacon { .. });
    let (protocol_version, peer_id, public_key, service_type, display_name, listen_port) = match msg
    {
        Message::Beacon {
            protocol_version,
            peer_id,
            public_key,
            service_type,
            display_name,
            listen_port,
        }
        | Message::DiscoveryResponse {
            protocol_version,
            peer_id,
            public_key,
            service_type,
            display_name,
            listen_port,
        } => (protocol_version, peer_id, public_key, service_type, display_name, listen_port),
        _ => return Reaction::Ignore,
    };
    if *protocol_version != PROTOCOL_VERSION || *peer_id == local.peer_id {
        return Reaction::Ignore;
    }
    if PeerId::from_public_key(public_key) != *peer_id {
        return Reaction::Ignore;
    }
    let reply = is_beacon
        && mode
            .advertise
            .as_ref()
            .map_or(false, |a| a.service_type == *service_type);
    if mode.browse.as_deref() == Some(service_type.as_str()) {
        return Reaction::Found {
            peer: Discovered {
                peer_id: *peer_id,
                display_name: display_name.clone(),
                addr: SocketAddr::new(from.ip(), *listen_port),
            },
            reply,
        };
    }
    if reply {
        Reaction::Reply
    } else {
        Reaction::Ignore
    }
}

/// Bind the multicast socket synchronously so bind errors surface to the caller.
pub fn bind_multicast(discovery_port: u16) -> std::io::Result<std::net::UdpSocket> {
    let sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    sock.set_multicast_ttl_v4(1)?;
    sock.set_multicast_loop_v4(true)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

pub struct DiscoveryTask {
    pub socket: std::net::UdpSocket,
    pub local: LocalPeer,
    pub discovery_port: u16,
    pub beacon_interval: Duration,
    /// A discovered peer is offered for dialing again only after this long.
    pub redial_after: Duration,
    pub mode: watch::Receiver<DiscoveryMode>,
    pub dial_tx: mpsc::UnboundedSender<Discovered>,
    pub shutdown: watch::Receiver<bool>,
}

impl DiscoveryTask {
    pub async fn run(self) -> std::io::Result<()> {
        let socket = UdpSocket::from_std(self.socket)?;
        let dest = SocketAddr::from((MULTICAST_GROUP, self.discovery_port));
        let mut shutdown = self.shutdown;
        let mut mode = self.mode;
        let mut beacon_tick = tokio::time::interval(self.beacon_interval);
        let mut last_dialed: HashMap<PeerId, Instant> = HashMap::new();
        let mut buf = vec![0u8; 65536];
        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = mode.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Beacon right away when advertising starts.
                    beacon_tick.reset_immediately();
                }
                _ = beacon_tick.tick() => {
                    let current = mode.borrow().clone();
                    if let Some(ad) = &current.advertise {
                        match beacon_frame(&self.local, ad, true) {
                            Ok(frame) => {
                                if let Err(e) = socket.send_to(&frame, dest).await {
                                    warn!(error = %e, "beacon send failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "beacon not encoded"),
                        }
                    }
                    last_dialed.retain(|_, t| t.elapsed() < self.redial_after);
                }
                recv = socket.recv_from(&mut buf) => {
                    // Some platforms report ICMP errors from earlier sends here.
                    let (n, from) = match recv {
                        Ok(x) => x,
                        Err(e) => {
                            debug!(error = %e, "discovery receive failed");
                            continue;
                        }
                    };
                    let Ok((msg, _)) = decode_frame(&buf[..n]) else {
                        trace!(%from, "undecodable discovery datagram");
                        continue;
                    };
                    let current = mode.borrow().clone();
                    let reply = match react(&msg, from, &self.local, &current) {
                        Reaction::Ignore => false,
                        Reaction::Reply => true,
                        Reaction::Found { peer, reply } => {
                            let due = last_dialed
                                .get(&peer.peer_id)
                                .map_or(true, |t| t.elapsed() >= self.redial_after);
                            if due {
                                debug!(
                                    peer = %peer.peer_id,
                                    name = %peer.display_name,
                                    addr = %peer.addr,
                                    "peer discovered"
                                );
                                last_dialed.insert(peer.peer_id, Instant::now());
                                if self.dial_tx.send(peer).is_err() {
                                    break;
                                }
                            }
                            reply
                        }
                    };
                    if reply {
                        if let Some(ad) = &current.advertise {
                            if let Ok(frame) = beacon_frame(&self.local, ad, false) {
                                let _ = socket.send_to(&frame, from).await;
                            }
                        }
                    }
                }
            }
        }
        debug!("discovery stopped");
        Ok(())
    }
}

fn beacon_frame(local: &LocalPeer, ad: &Advertisement, beacon: bool) -> std::io::Result<Vec<u8>> {
    let msg = if beacon {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            peer_id: local.peer_id,
            public_key: local.public_key.clone(),
            service_type: ad.service_type.clone(),
            display_name: ad.display_name.clone(),
            listen_port: local.listen_port,
        }
    } else {
        Message::DiscoveryResponse {
            protocol_version: PROTOCOL_VERSION,
            peer_id: local.peer_id,
            public_key: local.public_key.clone(),
            service_type: ad.service_type.clone(),
            display_name: ad.display_name.clone(),
            listen_port: local.listen_port,
        }
    };
    encode_frame(&msg).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
