//! Gossip sync protocol for one node kind
//!
//! Stateless checks (address, clock drift, protocol floor, signatures)
//! happen here; everything that touches the node list goes through the
//! registry under its lock. Rejections with a non-zero score are reported
//! against the sending peer.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    InvItem, InvType, ListSync, Message, MisbehaviorSink, PeerId, PeerNetwork, SYNC_STAGE_LIST,
};
use crate::chain::OutPoint;
use crate::consensus::{ConsensusParams, Network};
use crate::node::{
    Broadcast, BroadcastOutcome, GossipError, NodePing, NodeType, PingOutcome, Registry,
    MAX_SIG_TIME_DRIFT,
};

/// Whether `addr` may be announced as a service address on `params`'
/// network. Main net requires a routable IPv4 address on the default port;
/// test net a routable IPv4 address off the main port; regtest anything.
pub fn check_service_addr(addr: &SocketAddr, params: &ConsensusParams) -> Result<(), GossipError> {
    if params.network == Network::Regtest {
        return Ok(());
    }

    let routable = match addr.ip() {
        IpAddr::V4(ip) => {
            !(ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_documentation())
        }
        IpAddr::V6(_) => false,
    };
    if !routable {
        return Err(GossipError::InvalidAddress);
    }

    let main_port = ConsensusParams::main().default_port;
    let port_ok = match params.network {
        Network::Main => addr.port() == main_port,
        _ => addr.port() != main_port,
    };
    if !port_ok {
        return Err(GossipError::InvalidAddress);
    }
    Ok(())
}

pub struct GossipHandler {
    node_type: NodeType,
    registry: Arc<Registry>,
    network: Arc<dyn PeerNetwork>,
    peers: Arc<dyn MisbehaviorSink>,
    sync: Mutex<ListSync>,
}

impl GossipHandler {
    pub fn new(
        registry: Arc<Registry>,
        network: Arc<dyn PeerNetwork>,
        peers: Arc<dyn MisbehaviorSink>,
    ) -> Self {
        Self {
            node_type: registry.node_type(),
            registry,
            network,
            peers,
            sync: Mutex::new(ListSync::new()),
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn list_synced(&self) -> bool {
        self.sync.lock().is_synced(self.registry.now())
    }

    /// Handle one message from `peer`. Rejections are returned after the
    /// peer has been charged their misbehaviour score.
    pub fn process_message(&self, peer: &PeerId, message: Message) -> Result<(), GossipError> {
        let result = match message {
            Message::Announce(broadcast) => self.handle_announce(broadcast),
            Message::Ping(ping) => self.handle_ping(peer, ping),
            Message::ListRequest { collateral, .. } => self.handle_list_request(peer, collateral),
            Message::SyncStatus { count, .. } => {
                self.sync.lock().record_status(peer, count);
                Ok(())
            }
            Message::Inv(items) => {
                self.handle_inv(peer, &items);
                Ok(())
            }
            Message::GetData(items) => {
                self.handle_get_data(peer, &items);
                Ok(())
            }
        };

        if let Err(err) = &result {
            let score = err.dos_score();
            if score > 0 {
                warn!("{} from {} rejected: {} (misbehaviour {})", self.node_type, peer, err, score);
                self.peers.misbehaving(peer, score);
            } else {
                debug!("{} from {} ignored: {}", self.node_type, peer, err);
            }
        }
        result
    }

    fn handle_announce(&self, broadcast: Broadcast) -> Result<(), GossipError> {
        let now = self.registry.now();
        let hash = broadcast.hash();

        if !self.registry.mark_broadcast_seen(&broadcast) {
            self.sync.lock().added_list_entry(hash, now);
            return Ok(());
        }

        let params = self.registry.params();
        check_service_addr(&broadcast.addr, params)?;
        if broadcast.sig_time > now + MAX_SIG_TIME_DRIFT {
            return Err(GossipError::SignatureInFuture(broadcast.sig_time));
        }
        if broadcast.protocol_version < params.min_payments_protocol {
            return Err(GossipError::ProtocolTooOld(broadcast.protocol_version));
        }
        if !broadcast.verify() {
            return Err(GossipError::BadBroadcastSignature);
        }

        let relay = match self.registry.apply_broadcast(&broadcast)? {
            BroadcastOutcome::Added => true,
            BroadcastOutcome::Updated { relay } => relay,
            BroadcastOutcome::Unchanged => false,
        };
        self.sync.lock().added_list_entry(hash, now);
        if relay {
            self.relay_broadcast(&broadcast);
        }
        Ok(())
    }

    fn handle_ping(&self, peer: &PeerId, ping: NodePing) -> Result<(), GossipError> {
        if !self.registry.mark_ping_seen(&ping) {
            return Ok(());
        }

        let now = self.registry.now();
        if ping.sig_time > now + MAX_SIG_TIME_DRIFT {
            return Err(GossipError::SignatureInFuture(ping.sig_time));
        }
        if ping.sig_time <= now - MAX_SIG_TIME_DRIFT {
            return Err(GossipError::PingTooOld(ping.sig_time));
        }

        match self.registry.apply_ping(&ping)? {
            PingOutcome::Accepted { relay } => {
                if relay {
                    self.relay_ping(&ping);
                }
            }
            PingOutcome::UnknownNode => self.ask_for_entry(peer, &ping.collateral),
            PingOutcome::Ignored => {}
        }
        Ok(())
    }

    fn handle_list_request(
        &self,
        peer: &PeerId,
        collateral: Option<OutPoint>,
    ) -> Result<(), GossipError> {
        let hashes = self
            .registry
            .list_request(peer.ip(), peer.is_local(), collateral)?;
        let count = hashes.len();

        let items: Vec<InvItem> = hashes
            .into_iter()
            .map(|hash| InvItem::new(InvType::announce(self.node_type), hash))
            .collect();
        if !items.is_empty() {
            self.network.send(peer, Message::Inv(items));
        }

        if collateral.is_none() {
            self.network.send(
                peer,
                Message::SyncStatus {
                    node_type: self.node_type,
                    stage: SYNC_STAGE_LIST,
                    count: count as u32,
                },
            );
            debug!("Sent {} {} entries to {}", count, self.node_type, peer);
        }
        Ok(())
    }

    /// Whether an inventory item of this node kind is already known
    pub fn already_have(&self, item: &InvItem) -> bool {
        if item.inv_type == InvType::announce(self.node_type) {
            self.registry.seen_broadcast(&item.hash).is_some()
        } else if item.inv_type == InvType::ping(self.node_type) {
            self.registry.seen_ping(&item.hash).is_some()
        } else {
            // Winner votes are not handled here
            true
        }
    }

    fn handle_inv(&self, peer: &PeerId, items: &[InvItem]) {
        let wanted: Vec<InvItem> = items
            .iter()
            .filter(|item| item.inv_type.node_type() == self.node_type)
            .filter(|item| !self.already_have(item))
            .copied()
            .collect();
        if !wanted.is_empty() {
            self.network.send(peer, Message::GetData(wanted));
        }
    }

    fn handle_get_data(&self, peer: &PeerId, items: &[InvItem]) {
        for item in items {
            if item.inv_type == InvType::announce(self.node_type) {
                if let Some(broadcast) = self.registry.seen_broadcast(&item.hash) {
                    self.network.send(peer, Message::Announce(broadcast));
                }
            } else if item.inv_type == InvType::ping(self.node_type) {
                if let Some(ping) = self.registry.seen_ping(&item.hash) {
                    self.network.send(peer, Message::Ping(ping));
                }
            }
        }
    }

    /// Ask `peer` for one missing entry, at most once per ping interval
    pub fn ask_for_entry(&self, peer: &PeerId, collateral: &OutPoint) {
        if !self.registry.should_ask_for_entry(collateral) {
            return;
        }
        debug!("Asking {} for {} {}", peer, self.node_type, collateral);
        self.network.send(
            peer,
            Message::ListRequest {
                node_type: self.node_type,
                collateral: Some(*collateral),
            },
        );
    }

    /// Ask `peer` for the full list unless we did recently
    pub fn dseg_update(&self, peer: &PeerId) -> bool {
        if !self.registry.should_request_list(peer.ip(), peer.is_local()) {
            debug!("Already asked {} for the {} list", peer, self.node_type);
            return false;
        }
        self.network.send(
            peer,
            Message::ListRequest {
                node_type: self.node_type,
                collateral: None,
            },
        );
        self.sync.lock().requested_list(peer);
        true
    }

    pub fn relay_broadcast(&self, broadcast: &Broadcast) {
        self.network
            .relay_inv(InvItem::new(InvType::announce(self.node_type), broadcast.hash()));
    }

    pub fn relay_ping(&self, ping: &NodePing) {
        self.network
            .relay_inv(InvItem::new(InvType::ping(self.node_type), ping.hash()));
    }
}

/// Routes incoming messages to the handler of their node kind
pub struct GossipRouter {
    handlers: Vec<Arc<GossipHandler>>,
}

impl GossipRouter {
    pub fn new(handlers: Vec<Arc<GossipHandler>>) -> Self {
        Self { handlers }
    }

    pub fn handler(&self, node_type: NodeType) -> Option<&Arc<GossipHandler>> {
        self.handlers.iter().find(|h| h.node_type() == node_type)
    }

    pub fn process_message(&self, peer: &PeerId, message: Message) -> Result<(), GossipError> {
        if let Some(node_type) = message.node_type() {
            return match self.handler(node_type) {
                Some(handler) => handler.process_message(peer, message),
                None => Ok(()),
            };
        }

        // Inventory may mix kinds: split it per handler
        let (items, is_inv) = match message {
            Message::Inv(items) => (items, true),
            Message::GetData(items) => (items, false),
            _ => return Ok(()),
        };
        for handler in &self.handlers {
            let own: Vec<InvItem> = items
                .iter()
                .filter(|item| item.inv_type.node_type() == handler.node_type())
                .copied()
                .collect();
            if own.is_empty() {
                continue;
            }
            let message = if is_inv {
                Message::Inv(own)
            } else {
                Message::GetData(own)
            };
            handler.process_message(peer, message)?;
        }
        Ok(())
    }

    /// Request the full lists of every node kind from a new peer
    pub fn peer_connected(&self, peer: &PeerId) {
        for handler in &self.handlers {
            if handler.dseg_update(peer) {
                info!("Requested {} list from {}", handler.node_type(), peer);
            }
        }
    }
}
