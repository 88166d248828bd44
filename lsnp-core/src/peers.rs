//! Discovered peers keyed by their listening address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    /// Peer's bound listener (declared LISTEN_PORT, not the datagram's source port).
    pub addr: SocketAddr,
    /// Last identity the peer declared, if any.
    pub user_id: Option<String>,
    pub last_seen_millis: u64,
}

impl PeerRecord {
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<SocketAddr, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic from `addr`. Returns true when the peer was not known before.
    /// An identity seen at a new address replaces its old entry.
    pub fn observe(&mut self, addr: SocketAddr, user_id: Option<String>, now_millis: u64) -> bool {
        if let Some(id) = &user_id {
            self.peers
                .retain(|a, p| *a == addr || p.user_id.as_deref() != Some(id.as_str()));
        }
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_seen_millis = now_millis;
                if user_id.is_some() {
                    peer.user_id = user_id;
                }
                false
            }
            None => {
                self.peers.insert(
                    addr,
                    PeerRecord {
                        addr,
                        user_id,
                        last_seen_millis: now_millis,
                    },
                );
                true
            }
        }
    }

    /// Listener address of the peer that declared `user_id`.
    pub fn resolve(&self, user_id: &str) -> Option<SocketAddr> {
        self.peers
            .values()
            .find(|p| p.user_id.as_deref() == Some(user_id))
            .map(|p| p.addr)
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        let mut out: Vec<SocketAddr> = self.peers.keys().copied().collect();
        out.sort();
        out
    }

    /// Copy of every record, ordered by address.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.peers.values().cloned().collect();
        out.sort_by_key(|p| p.addr);
        out
    }

    /// Drop peers silent for at least `max_age_millis`; returns what was dropped.
    pub fn evict_stale(&mut self, now_millis: u64, max_age_millis: u64) -> Vec<PeerRecord> {
        let stale: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| now_millis.saturating_sub(p.last_seen_millis) >= max_age_millis)
            .map(|p| p.addr)
            .collect();
        stale
            .iter()
            .filter_map(|addr| self.peers.remove(addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
