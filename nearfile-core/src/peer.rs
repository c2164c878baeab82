//! Peer table: nearby devices keyed by id. Re-discovery updates, never duplicates.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::identity::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Radio,
    Datagram,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: DeviceId,
    pub display_name: String,
    /// Always present for peers seen on the datagram link.
    pub address: Option<IpAddr>,
    pub control_port: Option<u16>,
    pub data_port: Option<u16>,
    pub link: LinkKind,
    pub last_seen: Instant,
    pub connected: bool,
}

impl Peer {
    pub fn control_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.address?, self.control_port?))
    }

    /// Data socket, falling back to the control socket when the data port is unknown.
    pub fn data_addr(&self) -> Option<SocketAddr> {
        let port = self.data_port.or(self.control_port)?;
        Some(SocketAddr::new(self.address?, port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    Added,
    Updated,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<DeviceId, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a peer heard on the datagram link.
    pub fn observe_datagram(
        &mut self,
        id: &DeviceId,
        display_name: &str,
        from: SocketAddr,
        data_port: Option<u16>,
        now: Instant,
    ) -> PeerChange {
        match self.peers.get_mut(id) {
            Some(p) => {
                p.display_name = display_name.to_string();
                p.address = Some(from.ip());
                p.control_port = Some(from.port());
                if data_port.is_some() {
                    p.data_port = data_port;
                }
                p.link = LinkKind::Datagram;
                p.last_seen = now;
                PeerChange::Updated
            }
            None => {
                self.peers.insert(
                    id.clone(),
                    Peer {
                        id: id.clone(),
                        display_name: display_name.to_string(),
                        address: Some(from.ip()),
                        control_port: Some(from.port()),
                        data_port,
                        link: LinkKind::Datagram,
                        last_seen: now,
                        connected: false,
                    },
                );
                PeerChange::Added
            }
        }
    }

    /// Register or refresh a peer heard on the radio link. A peer already
    /// reachable by address keeps the datagram link.
    pub fn observe_radio(&mut self, id: &DeviceId, display_name: &str, now: Instant) -> PeerChange {
        match self.peers.get_mut(id) {
            Some(p) => {
                p.display_name = display_name.to_string();
                if p.address.is_none() {
                    p.link = LinkKind::Radio;
                }
                p.last_seen = now;
                PeerChange::Updated
            }
            None => {
                self.peers.insert(
                    id.clone(),
                    Peer {
                        id: id.clone(),
                        display_name: display_name.to_string(),
                        address: None,
                        control_port: None,
                        data_port: None,
                        link: LinkKind::Radio,
                        last_seen: now,
                        connected: false,
                    },
                );
                PeerChange::Added
            }
        }
    }

    /// Refresh last-seen on any traffic from a known peer.
    pub fn touch(&mut self, id: &DeviceId, now: Instant) {
        if let Some(p) = self.peers.get_mut(id) {
            p.last_seen = now;
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<&Peer> {
        self.peers.values().find(|p| p.address == Some(ip))
    }

    /// Peer whose control socket is `addr`.
    pub fn find_by_control_addr(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers
            .values()
            .find(|p| p.address == Some(addr.ip()) && p.control_port == Some(addr.port()))
    }

    /// Record a data port learned outside discovery (PREPARE_TRANSFER_ACK).
    pub fn set_data_port(&mut self, id: &DeviceId, port: u16) -> bool {
        match self.peers.get_mut(id) {
            Some(p) => {
                p.data_port = Some(port);
                true
            }
            None => false,
        }
    }

    /// Set the connected flag. Only one peer is connected at a time.
    pub fn set_connected(&mut self, id: &DeviceId, connected: bool) -> bool {
        if connected {
            for p in self.peers.values_mut() {
                p.connected = false;
            }
        }
        match self.peers.get_mut(id) {
            Some(p) => {
                p.connected = connected;
                true
            }
            None => false,
        }
    }

    pub fn connected(&self) -> Option<&Peer> {
        self.peers.values().find(|p| p.connected)
    }

    /// All peers, sorted by name then id.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut out: Vec<Peer> = self.peers.values().cloned().collect();
        out.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Remove unconnected peers unseen for `ttl`. Returns removed ids.
    pub fn prune(&mut self, ttl: Duration, now: Instant) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .peers
            .values()
            .filter(|p| !p.connected && now.saturating_duration_since(p.last_seen) >= ttl)
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
