//! The locally operated service node
//!
//! Holds the operator key, announces the node when it is missing from the
//! registry (if the collateral key is available) and produces its pings.
//! The registry entry is looked up again on every call; a reference to it
//! is never kept.

use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, info};

use super::{
    Broadcast, BroadcastOutcome, GossipError, NodePing, NodeType, PingOutcome, Registry,
    ServiceNode, MIN_PING_SECONDS,
};
use crate::chain::OutPoint;
use crate::constants::PROTOCOL_VERSION;
use crate::crypto::{Hash, PrivateKey, PublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStatus {
    Initial,
    /// Not registered and no collateral key to announce with
    NotInList,
    Started,
}

impl fmt::Display for ActiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ActiveStatus::Initial => "Node just started, not yet activated",
            ActiveStatus::NotInList => "Node not in the list",
            ActiveStatus::Started => "Node successfully started",
        };
        f.write_str(text)
    }
}

/// What the caller should relay after a status round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveAction {
    Announce(Broadcast),
    Ping(NodePing),
    Idle,
}

pub struct ActiveNode {
    node_type: NodeType,
    collateral: OutPoint,
    service_addr: SocketAddr,
    operator_key: PrivateKey,
    collateral_key: Option<PrivateKey>,
    status: ActiveStatus,
}

impl ActiveNode {
    pub fn new(
        node_type: NodeType,
        collateral: OutPoint,
        service_addr: SocketAddr,
        operator_key: PrivateKey,
        collateral_key: Option<PrivateKey>,
    ) -> Self {
        Self {
            node_type,
            collateral,
            service_addr,
            operator_key,
            collateral_key,
            status: ActiveStatus::Initial,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn collateral(&self) -> OutPoint {
        self.collateral
    }

    pub fn status(&self) -> ActiveStatus {
        self.status
    }

    pub fn operator_pubkey(&self) -> PublicKey {
        self.operator_key.public_key()
    }

    /// Our registry entry, if registered under our operator key
    pub fn resolve(&self, registry: &Registry) -> Option<ServiceNode> {
        let pubkey = self.operator_pubkey();
        registry
            .find_by_collateral(&self.collateral)
            .filter(|node| node.pubkey_node == pubkey)
    }

    pub fn create_ping(&self, block_hash: Hash, now: i64) -> NodePing {
        NodePing::new(self.node_type, self.collateral, block_hash, now, &self.operator_key)
    }

    /// Signed announcement carrying a fresh ping; needs the collateral key
    pub fn create_broadcast(&self, block_hash: Hash, now: i64) -> Option<Broadcast> {
        let collateral_key = self.collateral_key.as_ref()?;
        let ping = self.create_ping(block_hash, now);
        Some(Broadcast::new(
            self.node_type,
            self.collateral,
            self.service_addr,
            collateral_key,
            self.operator_pubkey(),
            now,
            PROTOCOL_VERSION,
            Some(ping),
        ))
    }

    /// Whether our own ping is due
    pub fn ping_due(&self, node: &ServiceNode, now: i64) -> bool {
        !node.is_pinged_within(MIN_PING_SECONDS - 60, now)
    }

    /// One status round: ping if registered, announce if missing and able
    /// to, otherwise report the status. `tip_hash` is the block referenced
    /// by any new ping.
    pub fn manage_status(
        &mut self,
        registry: &Registry,
        tip_hash: Hash,
    ) -> Result<ActiveAction, GossipError> {
        let now = registry.now();

        if let Some(node) = self.resolve(registry) {
            if self.status != ActiveStatus::Started {
                info!("{} {} found in the list, started", self.node_type, self.collateral);
            }
            self.status = ActiveStatus::Started;

            if !self.ping_due(&node, now) {
                return Ok(ActiveAction::Idle);
            }
            let ping = self.create_ping(tip_hash, now);
            registry.mark_ping_seen(&ping);
            return match registry.apply_ping(&ping)? {
                PingOutcome::Accepted { .. } => {
                    debug!("Sending {} ping for {}", self.node_type, self.collateral);
                    Ok(ActiveAction::Ping(ping))
                }
                _ => Ok(ActiveAction::Idle),
            };
        }

        let broadcast = match self.create_broadcast(tip_hash, now) {
            Some(broadcast) => broadcast,
            None => {
                self.status = ActiveStatus::NotInList;
                return Ok(ActiveAction::Idle);
            }
        };

        registry.mark_broadcast_seen(&broadcast);
        match registry.apply_broadcast(&broadcast)? {
            BroadcastOutcome::Added | BroadcastOutcome::Updated { .. } => {
                info!("Announced {} {} at {}", self.node_type, self.collateral, self.service_addr);
                self.status = ActiveStatus::Started;
                Ok(ActiveAction::Announce(broadcast))
            }
            BroadcastOutcome::Unchanged => Ok(ActiveAction::Idle),
        }
    }
}

impl fmt::Debug for ActiveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveNode")
            .field("node_type", &self.node_type)
            .field("collateral", &self.collateral)
            .field("service_addr", &self.service_addr)
            .field("status", &self.status)
            .finish()
    }
}
