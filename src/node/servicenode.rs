//! A registered service node and its activation state machine

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use super::{
    Broadcast, NodePing, NodeType, CHECK_SECONDS, EXPIRATION_SECONDS, MIN_BROADCAST_SECONDS,
    MIN_PING_SECONDS, REMOVAL_SECONDS,
};
use crate::chain::{CollateralView, OutPoint};
use crate::consensus::encode_compact;
use crate::crypto::{hash_bytes, Hash, PublicKey, SchnorrSignature};

const MONTH_SECONDS: i64 = 30 * 24 * 60 * 60;

/// Activation state, recomputed by [`ServiceNode::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    PreEnabled,
    Enabled,
    Expired,
    Remove,
    VinSpent,
}

impl NodeState {
    /// Eligible for admission and pings
    pub fn is_active(&self) -> bool {
        matches!(self, NodeState::PreEnabled | NodeState::Enabled)
    }

    /// States evicted by a registry sweep
    pub fn is_terminal(&self, force_expired: bool) -> bool {
        match self {
            NodeState::Remove | NodeState::VinSpent => true,
            NodeState::Expired => force_expired,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::PreEnabled => "PRE_ENABLED",
            NodeState::Enabled => "ENABLED",
            NodeState::Expired => "EXPIRED",
            NodeState::Remove => "REMOVE",
            NodeState::VinSpent => "VIN_SPENT",
        };
        f.write_str(name)
    }
}

/// Deterministic score of a collateral for the block with hash `block_hash`.
///
/// `|H(block || txid + index) - H(block)|` over 256-bit integers. Every
/// node in the network must compute the same value.
pub fn calculate_score(collateral: &OutPoint, block_hash: &Hash) -> U256 {
    let (aux, _) = collateral
        .txid
        .to_u256()
        .overflowing_add(U256::from(collateral.index));

    let hash2 = hash_bytes(&block_hash.0).to_u256();

    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(&block_hash.0);
    bytes.extend_from_slice(&Hash::from_u256(aux).0);
    let hash3 = hash_bytes(&bytes).to_u256();

    if hash3 > hash2 {
        hash3 - hash2
    } else {
        hash2 - hash3
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node_type: NodeType,
    pub collateral: OutPoint,
    pub addr: SocketAddr,
    pub pubkey_collateral: PublicKey,
    pub pubkey_node: PublicKey,
    pub signature: SchnorrSignature,
    pub sig_time: i64,
    pub protocol_version: u32,
    pub last_ping: Option<NodePing>,
    pub state: NodeState,
    /// Time of the last state recomputation (0 = never)
    pub last_checked: i64,
}

impl ServiceNode {
    /// Node described by a validated broadcast. Starts pre-enabled and is
    /// never treated as enabled before its first check.
    pub fn from_broadcast(broadcast: &Broadcast) -> Self {
        Self {
            node_type: broadcast.node_type,
            collateral: broadcast.collateral,
            addr: broadcast.addr,
            pubkey_collateral: broadcast.pubkey_collateral.clone(),
            pubkey_node: broadcast.pubkey_node.clone(),
            signature: broadcast.signature.clone(),
            sig_time: broadcast.sig_time,
            protocol_version: broadcast.protocol_version,
            last_ping: broadcast.last_ping.clone(),
            state: NodeState::PreEnabled,
            last_checked: 0,
        }
    }

    /// Re-create the announcement this node was built from, carrying the
    /// current last ping
    pub fn to_broadcast(&self) -> Broadcast {
        Broadcast {
            node_type: self.node_type,
            collateral: self.collateral,
            addr: self.addr,
            pubkey_collateral: self.pubkey_collateral.clone(),
            pubkey_node: self.pubkey_node.clone(),
            signature: self.signature.clone(),
            sig_time: self.sig_time,
            protocol_version: self.protocol_version,
            last_ping: self.last_ping.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == NodeState::Enabled
    }

    /// Whether the last ping is less than `seconds` older than `now`
    pub fn is_pinged_within(&self, seconds: i64, now: i64) -> bool {
        self.last_ping
            .as_ref()
            .map(|ping| now - ping.sig_time < seconds)
            .unwrap_or(false)
    }

    pub fn is_broadcasted_within(&self, seconds: i64, now: i64) -> bool {
        now - self.sig_time < seconds
    }

    /// Recompute the activation state.
    ///
    /// Skipped if the node was checked less than five seconds ago unless
    /// `force` is set. `VinSpent` is final.
    pub fn check(&mut self, now: i64, force: bool, coins: &dyn CollateralView) {
        if !force && now - self.last_checked < CHECK_SECONDS {
            return;
        }
        self.last_checked = now;

        if self.state == NodeState::VinSpent {
            return;
        }

        if !self.is_pinged_within(REMOVAL_SECONDS, now) {
            self.state = NodeState::Remove;
            return;
        }
        if !self.is_pinged_within(EXPIRATION_SECONDS, now) {
            self.state = NodeState::Expired;
            return;
        }

        let ping_time = self.last_ping.as_ref().map(|ping| ping.sig_time).unwrap_or(0);
        if ping_time - self.sig_time < MIN_PING_SECONDS {
            self.state = NodeState::PreEnabled;
            return;
        }

        if coins.is_spent(&self.collateral) {
            self.state = NodeState::VinSpent;
            return;
        }

        self.state = NodeState::Enabled;
    }

    /// Take over the fields of a strictly newer broadcast. The embedded
    /// ping is kept only if it is newer and signed by the new operator key.
    pub fn update_from_broadcast(&mut self, broadcast: &Broadcast) -> bool {
        if broadcast.sig_time <= self.sig_time {
            return false;
        }

        self.pubkey_node = broadcast.pubkey_node.clone();
        self.sig_time = broadcast.sig_time;
        self.signature = broadcast.signature.clone();
        self.protocol_version = broadcast.protocol_version;
        self.addr = broadcast.addr;
        self.last_checked = 0;

        if let Some(ping) = &broadcast.last_ping {
            let newer = self
                .last_ping
                .as_ref()
                .map(|current| ping.sig_time > current.sig_time)
                .unwrap_or(true);
            if newer && ping.verify(&self.pubkey_node) {
                self.last_ping = Some(ping.clone());
            }
        }
        true
    }

    /// Whether a broadcast may replace this node's announcement
    pub fn accepts_update(&self, broadcast: &Broadcast, now: i64) -> bool {
        self.pubkey_collateral == broadcast.pubkey_collateral
            && !self.is_broadcasted_within(MIN_BROADCAST_SECONDS, now)
    }

    /// Seconds since this node was last paid. Nodes never paid, or paid
    /// more than 30 days ago, get 30 days plus a deterministic offset
    /// derived from the collateral and signature time.
    pub fn seconds_since_payment(&self, now: i64, last_paid: Option<i64>) -> i64 {
        if let Some(paid) = last_paid {
            let elapsed = now - paid;
            if elapsed < MONTH_SECONDS {
                return elapsed;
            }
        }

        let mut bytes = Vec::with_capacity(44);
        bytes.extend_from_slice(&self.collateral.to_bytes());
        bytes.extend_from_slice(&self.sig_time.to_le_bytes());
        let offset = encode_compact(hash_bytes(&bytes).to_u256());
        MONTH_SECONDS + offset as i64
    }
}
