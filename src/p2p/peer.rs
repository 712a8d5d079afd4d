//! Peer bookkeeping and misbehaviour scoring
//!
//! Connection handling lives outside this crate; the gossip layer only
//! needs to identify the sending peer and report a misbehaviour score
//! against it. The ban threshold policy sits here.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Score at which a peer is banned
pub const BAN_THRESHOLD: u32 = 100;

/// Identity of a connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub id: u64,
    pub addr: SocketAddr,
}

impl PeerId {
    pub fn new(id: u64, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Loopback, private or link-local address
    pub fn is_local(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
            IpAddr::V6(ip) => ip.is_loopback() || (ip.segments()[0] & 0xffc0) == 0xfe80,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer={} ({})", self.id, self.addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Disconnected,
    Banned,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub state: PeerState,
    /// Protocol version from the handshake
    pub version: u32,
    /// Accumulated misbehaviour (100 = ban)
    pub misbehavior_score: u32,
}

impl PeerInfo {
    pub fn new(peer: PeerId, version: u32) -> Self {
        Self {
            peer,
            state: PeerState::Connected,
            version,
            misbehavior_score: 0,
        }
    }

    pub fn add_misbehavior(&mut self, points: u32) {
        self.misbehavior_score = self.misbehavior_score.saturating_add(points);
        if self.should_ban() {
            self.state = PeerState::Banned;
        }
    }

    pub fn should_ban(&self) -> bool {
        self.misbehavior_score >= BAN_THRESHOLD
    }
}

/// Receiver of misbehaviour reports
pub trait MisbehaviorSink: Send + Sync {
    fn misbehaving(&self, peer: &PeerId, score: u32);
}

#[derive(Debug, Default)]
pub struct PeerManager {
    peers: HashMap<u64, PeerInfo>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_connected(&mut self, peer: PeerId, version: u32) {
        self.peers
            .entry(peer.id)
            .and_modify(|info| {
                if info.state != PeerState::Banned {
                    info.state = PeerState::Connected;
                }
                info.version = version;
            })
            .or_insert_with(|| PeerInfo::new(peer, version));
    }

    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        if let Some(info) = self.peers.get_mut(&peer.id) {
            if info.state != PeerState::Banned {
                info.state = PeerState::Disconnected;
            }
        }
    }

    /// Add points against a peer; unknown peers are tracked from here on
    pub fn report_misbehavior(&mut self, peer: &PeerId, points: u32) {
        let info = self
            .peers
            .entry(peer.id)
            .or_insert_with(|| PeerInfo::new(*peer, 0));
        info.add_misbehavior(points);
        if info.should_ban() {
            warn!("Banning {} (misbehaviour {})", peer, info.misbehavior_score);
        }
    }

    pub fn misbehavior_score(&self, peer: &PeerId) -> u32 {
        self.peers
            .get(&peer.id)
            .map(|info| info.misbehavior_score)
            .unwrap_or(0)
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.peers
            .get(&peer.id)
            .map(|info| info.state == PeerState::Banned)
            .unwrap_or(false)
    }

    /// Whether any connection from `ip` was banned
    pub fn is_ip_banned(&self, ip: IpAddr) -> bool {
        self.peers
            .values()
            .any(|info| info.state == PeerState::Banned && info.peer.ip() == ip)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|info| info.state == PeerState::Connected)
            .map(|info| info.peer)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|info| info.state == PeerState::Connected)
            .count()
    }
}

impl MisbehaviorSink for Mutex<PeerManager> {
    fn misbehaving(&self, peer: &PeerId, score: u32) {
        self.lock().report_misbehavior(peer, score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u64, addr: &str) -> PeerId {
        PeerId::new(id, addr.parse().unwrap())
    }

    #[test]
    fn test_peer_connection() {
        let mut pm = PeerManager::new();
        let a = peer(1, "8.8.8.8:9340");
        pm.peer_connected(a, 70210);
        assert_eq!(pm.connected_count(), 1);

        pm.peer_disconnected(&a);
        assert_eq!(pm.connected_count(), 0);
    }

    #[test]
    fn test_misbehavior_bans_at_threshold() {
        let pm = Mutex::new(PeerManager::new());
        let a = peer(1, "8.8.8.8:9340");
        pm.lock().peer_connected(a, 70210);

        pm.misbehaving(&a, 34);
        pm.misbehaving(&a, 33);
        assert!(!pm.lock().is_banned(&a));
        assert_eq!(pm.lock().misbehavior_score(&a), 67);

        pm.misbehaving(&a, 33);
        assert!(pm.lock().is_banned(&a));
        assert!(pm.lock().connected_peers().is_empty());

        // Reconnecting does not lift a ban
        pm.lock().peer_connected(a, 70210);
        assert!(pm.lock().is_banned(&a));
        assert!(pm.lock().is_ip_banned(a.ip()));
        assert!(!pm.lock().is_ip_banned("8.8.4.4".parse().unwrap()));
    }

    #[test]
    fn test_local_addresses() {
        assert!(peer(1, "127.0.0.1:1").is_local());
        assert!(peer(1, "192.168.1.4:1").is_local());
        assert!(peer(1, "[::1]:1").is_local());
        assert!(!peer(1, "8.8.8.8:1").is_local());
    }
}
