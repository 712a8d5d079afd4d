//! Service-node registry
//!
//! One registry per node kind. The node list, the seen-sets and the
//! request-throttling maps sit behind a single mutex; every operation
//! takes it for its whole duration, so each gossip message is applied
//! atomically and no caller observes a half-updated list.

use parking_lot::Mutex;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::{
    calculate_score, Broadcast, GossipError, NodePing, NodeType, ServiceNode, DSEG_SECONDS,
    MIN_CONFIRMATIONS, MIN_PING_SECONDS, PING_MAX_BLOCK_AGE, REMOVAL_SECONDS,
};
use crate::chain::{ChainIndex, CollateralView, OutPoint};
use crate::consensus::ConsensusParams;
use crate::crypto::{Hash, PublicKey};
use crate::time::Clock;

/// Everything a registry holds; also its cache format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryState {
    pub nodes: Vec<ServiceNode>,
    pub seen_broadcasts: HashMap<Hash, Broadcast>,
    pub seen_pings: HashMap<Hash, NodePing>,
    /// Peers that asked us for the full list, until when they may not again
    pub asked_us_for_list: HashMap<IpAddr, i64>,
    /// Peers we asked for the full list
    pub we_asked_for_list: HashMap<IpAddr, i64>,
    /// Single entries we asked for
    pub we_asked_for_entry: HashMap<OutPoint, i64>,
}

impl RegistryState {
    fn position(&self, collateral: &OutPoint) -> Option<usize> {
        self.nodes.iter().position(|node| node.collateral == *collateral)
    }
}

/// Result of applying a validated announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// New node admitted
    Added,
    /// Known node took over the newer announcement
    Updated { relay: bool },
    /// Known node, announcement not applicable (too soon or different key)
    Unchanged,
}

/// Result of applying a ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Accepted { relay: bool },
    /// No node with this collateral; the announcement should be requested
    UnknownNode,
    /// Known node not eligible for pings (outdated protocol)
    Ignored,
}

pub struct Registry {
    node_type: NodeType,
    params: Arc<ConsensusParams>,
    chain: Arc<dyn ChainIndex>,
    coins: Arc<dyn CollateralView>,
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
    /// Registry whose addresses this one may not claim
    address_owner: OnceLock<Arc<Registry>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("node_type", &self.node_type)
            .field("nodes", &state.nodes.len())
            .field("seen_broadcasts", &state.seen_broadcasts.len())
            .field("seen_pings", &state.seen_pings.len())
            .finish()
    }
}

impl Registry {
    pub fn new(
        node_type: NodeType,
        params: Arc<ConsensusParams>,
        chain: Arc<dyn ChainIndex>,
        coins: Arc<dyn CollateralView>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            node_type,
            params,
            chain,
            coins,
            clock,
            state: Mutex::new(RegistryState::default()),
            address_owner: OnceLock::new(),
        }
    }

    /// Refuse announcements for addresses already held in `owner`.
    /// Systemnodes defer to masternodes; the link is one way and set once.
    pub fn defer_addresses_to(&self, owner: Arc<Registry>) {
        if self.address_owner.set(owner).is_err() {
            warn!("{} registry already defers its addresses", self.node_type);
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Insert a node unless its collateral is already registered or it is
    /// not active
    pub fn add(&self, node: ServiceNode) -> bool {
        let mut state = self.state.lock();
        Self::add_locked(&mut state, node)
    }

    fn add_locked(state: &mut RegistryState, node: ServiceNode) -> bool {
        if !node.state.is_active() || state.position(&node.collateral).is_some() {
            return false;
        }
        info!(
            "Adding {} {} at {} ({} now)",
            node.node_type,
            node.collateral,
            node.addr,
            state.nodes.len() + 1
        );
        state.nodes.push(node);
        true
    }

    pub fn find_by_collateral(&self, collateral: &OutPoint) -> Option<ServiceNode> {
        let state = self.state.lock();
        state.nodes.iter().find(|node| node.collateral == *collateral).cloned()
    }

    /// Lookup by operational key
    pub fn find_by_pubkey(&self, pubkey: &PublicKey) -> Option<ServiceNode> {
        let state = self.state.lock();
        state.nodes.iter().find(|node| node.pubkey_node == *pubkey).cloned()
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<ServiceNode> {
        let state = self.state.lock();
        state.nodes.iter().find(|node| node.addr == *addr).cloned()
    }

    pub fn remove(&self, collateral: &OutPoint) {
        let mut state = self.state.lock();
        if let Some(pos) = state.position(collateral) {
            let node = state.nodes.remove(pos);
            info!("Removing {} {} ({} now)", node.node_type, node.collateral, state.nodes.len());
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All nodes, states as last computed
    pub fn nodes(&self) -> Vec<ServiceNode> {
        self.state.lock().nodes.clone()
    }

    /// Refresh every node's state; never evicts
    pub fn check(&self) {
        let now = self.clock.now();
        let coins = self.coins.as_ref();
        let mut state = self.state.lock();
        for node in state.nodes.iter_mut() {
            node.check(now, false, coins);
        }
    }

    /// Refresh states, evict terminal nodes and prune the seen-sets and
    /// request maps. Returns the number of evicted nodes.
    pub fn check_and_remove(&self, force_expired: bool) -> usize {
        let now = self.clock.now();
        let coins = self.coins.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        for node in state.nodes.iter_mut() {
            node.check(now, false, coins);
        }

        let (evicted, kept): (Vec<ServiceNode>, Vec<ServiceNode>) = state
            .nodes
            .drain(..)
            .partition(|node| node.state.is_terminal(force_expired));
        state.nodes = kept;

        for node in &evicted {
            info!(
                "Removing inactive {} {} ({}), {} left",
                node.node_type,
                node.collateral,
                node.state,
                state.nodes.len()
            );
            // Lets the node come back through a ping without a new announcement
            state
                .seen_broadcasts
                .retain(|_, broadcast| broadcast.collateral != node.collateral);
            state.we_asked_for_entry.remove(&node.collateral);
        }

        state.asked_us_for_list.retain(|_, until| *until >= now);
        state.we_asked_for_list.retain(|_, until| *until >= now);
        state.we_asked_for_entry.retain(|_, until| *until >= now);

        let cutoff = now - REMOVAL_SECONDS * 2;
        state.seen_broadcasts.retain(|_, broadcast| {
            broadcast
                .last_ping
                .as_ref()
                .map(|ping| ping.sig_time >= cutoff)
                .unwrap_or(false)
        });
        state.seen_pings.retain(|_, ping| ping.sig_time >= cutoff);

        evicted.len()
    }

    /// Confirmations of a node's collateral at the current tip
    pub fn collateral_age(&self, collateral: &OutPoint) -> Option<u64> {
        self.coins.input_age(collateral, self.chain.height())
    }

    /// Score of a collateral at `height`, `None` if the block is unknown
    pub fn calculate_score(&self, collateral: &OutPoint, height: u64) -> Option<U256> {
        let block_hash = self.chain.block_hash(height)?;
        Some(calculate_score(collateral, &block_hash))
    }

    /// Nodes meeting the protocol floor, scored for `block_hash` and sorted
    /// best first. Equal scores fall back to collateral order.
    fn ranked(
        &self,
        state: &mut RegistryState,
        block_hash: &Hash,
        min_protocol: u32,
        only_enabled: bool,
    ) -> Vec<(U256, ServiceNode)> {
        let now = self.clock.now();
        let coins = self.coins.as_ref();

        let mut scored: Vec<(U256, ServiceNode)> = state
            .nodes
            .iter_mut()
            .filter_map(|node| {
                if node.protocol_version < min_protocol {
                    return None;
                }
                if only_enabled {
                    node.check(now, false, coins);
                    if !node.is_enabled() {
                        return None;
                    }
                }
                Some((calculate_score(&node.collateral, block_hash), node.clone()))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.collateral.cmp(&b.1.collateral))
        });
        scored
    }

    /// Enabled nodes at or above `min_protocol`, ranked from 1 by
    /// descending score at `height`. Empty if the block is unknown.
    pub fn get_ranks(&self, height: u64, min_protocol: u32) -> Vec<(usize, ServiceNode)> {
        let block_hash = match self.chain.block_hash(height) {
            Some(hash) => hash,
            None => return Vec::new(),
        };
        let mut state = self.state.lock();
        self.ranked(&mut state, &block_hash, min_protocol, true)
            .into_iter()
            .enumerate()
            .map(|(i, (_, node))| (i + 1, node))
            .collect()
    }

    /// 1-based rank of one collateral
    pub fn get_rank(
        &self,
        collateral: &OutPoint,
        height: u64,
        min_protocol: u32,
        only_enabled: bool,
    ) -> Option<usize> {
        let block_hash = self.chain.block_hash(height)?;
        let mut state = self.state.lock();
        self.ranked(&mut state, &block_hash, min_protocol, only_enabled)
            .iter()
            .position(|(_, node)| node.collateral == *collateral)
            .map(|pos| pos + 1)
    }

    /// Highest-scoring enabled node at `height`
    pub fn current_winner(&self, height: u64, min_protocol: u32) -> Option<ServiceNode> {
        self.get_ranks(height, min_protocol)
            .into_iter()
            .next()
            .map(|(_, node)| node)
    }

    pub fn count_enabled(&self, min_protocol: u32) -> usize {
        let now = self.clock.now();
        let coins = self.coins.as_ref();
        let mut state = self.state.lock();
        let mut count = 0;
        for node in state.nodes.iter_mut() {
            node.check(now, false, coins);
            if node.is_enabled() && node.protocol_version >= min_protocol {
                count += 1;
            }
        }
        count
    }

    /// Enabled nodes after a state refresh, any protocol
    pub fn enabled_nodes(&self) -> Vec<ServiceNode> {
        let now = self.clock.now();
        let coins = self.coins.as_ref();
        let mut state = self.state.lock();
        state
            .nodes
            .iter_mut()
            .filter_map(|node| {
                node.check(now, false, coins);
                node.is_enabled().then(|| node.clone())
            })
            .collect()
    }

    /// Record an announcement in the seen-set. False if it was already there.
    pub fn mark_broadcast_seen(&self, broadcast: &Broadcast) -> bool {
        let mut state = self.state.lock();
        let hash = broadcast.hash();
        if state.seen_broadcasts.contains_key(&hash) {
            return false;
        }
        state.seen_broadcasts.insert(hash, broadcast.clone());
        true
    }

    /// Record a ping in the seen-set. False if it was already there.
    pub fn mark_ping_seen(&self, ping: &NodePing) -> bool {
        let mut state = self.state.lock();
        let hash = ping.hash();
        if state.seen_pings.contains_key(&hash) {
            return false;
        }
        state.seen_pings.insert(hash, ping.clone());
        true
    }

    pub fn seen_broadcast(&self, hash: &Hash) -> Option<Broadcast> {
        self.state.lock().seen_broadcasts.get(hash).cloned()
    }

    pub fn seen_ping(&self, hash: &Hash) -> Option<NodePing> {
        self.state.lock().seen_pings.get(hash).cloned()
    }

    pub fn seen_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.seen_broadcasts.len(), state.seen_pings.len())
    }

    /// Apply an announcement whose signature, time and protocol have been
    /// checked. Updates a known node or, after the collateral checks,
    /// admits a new one.
    pub fn apply_broadcast(&self, broadcast: &Broadcast) -> Result<BroadcastOutcome, GossipError> {
        // Owner checked before our own lock is taken
        if let Some(owner) = self.address_owner.get() {
            if owner.find_by_addr(&broadcast.addr).is_some() {
                debug!("{} address {} held by a {}", self.node_type, broadcast.addr, owner.node_type);
                return Err(GossipError::AddressInUse);
            }
        }

        let now = self.clock.now();
        let coins = self.coins.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let address_taken = state
            .nodes
            .iter()
            .any(|node| node.addr == broadcast.addr && node.collateral != broadcast.collateral);
        if address_taken {
            return Err(GossipError::AddressInUse);
        }

        if let Some(pos) = state.position(&broadcast.collateral) {
            let node = &mut state.nodes[pos];
            if node.sig_time >= broadcast.sig_time {
                return Err(GossipError::StaleBroadcast);
            }

            if node.state.is_active() {
                if !node.accepts_update(broadcast, now) {
                    return Ok(BroadcastOutcome::Unchanged);
                }
                node.update_from_broadcast(broadcast);
                node.check(now, true, coins);
                let relay = node.is_enabled();
                if let Some(ping) = &node.last_ping {
                    state.seen_pings.insert(ping.hash(), ping.clone());
                }
                debug!("Updated {} {} from newer announcement", self.node_type, broadcast.collateral);
                return Ok(BroadcastOutcome::Updated { relay });
            }

            // Inactive entry: replaced by the announcement if it checks out
            state.nodes.remove(pos);
        }

        let coin = coins
            .collateral(&broadcast.collateral)
            .filter(|coin| !coin.spent)
            .ok_or(GossipError::CollateralUnavailable)?;
        if coin.output.pubkey_hash != broadcast.pubkey_collateral.pubkey_hash() {
            return Err(GossipError::CollateralKeyMismatch);
        }
        if coin.output.amount != self.node_type.collateral(&self.params) {
            return Err(GossipError::CollateralAmount(coin.output.amount));
        }

        let tip_height = self.chain.height();
        let confirmations = coins.input_age(&broadcast.collateral, tip_height).unwrap_or(0);
        if confirmations < MIN_CONFIRMATIONS {
            // Forget it so the announcement is accepted once confirmed
            state.seen_broadcasts.remove(&broadcast.hash());
            return Err(GossipError::InsufficientConfirmations(confirmations));
        }

        if let Some(confirmed) = self.chain.at_height(coin.height + MIN_CONFIRMATIONS - 1) {
            if confirmed.time > broadcast.sig_time {
                return Err(GossipError::SignedBeforeConfirmation);
            }
        }

        if let Some(ping) = &broadcast.last_ping {
            state.seen_pings.insert(ping.hash(), ping.clone());
        }
        state
            .seen_broadcasts
            .insert(broadcast.hash(), broadcast.clone());

        let mut node = ServiceNode::from_broadcast(broadcast);
        node.check(now, true, coins);
        if Self::add_locked(state, node) {
            Ok(BroadcastOutcome::Added)
        } else {
            Ok(BroadcastOutcome::Unchanged)
        }
    }

    /// Apply a ping whose signature time lies within the allowed drift
    pub fn apply_ping(&self, ping: &NodePing) -> Result<PingOutcome, GossipError> {
        let now = self.clock.now();
        let coins = self.coins.as_ref();
        let tip_height = self.chain.height();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let pos = match state.position(&ping.collateral) {
            Some(pos) => pos,
            None => return Ok(PingOutcome::UnknownNode),
        };
        let node = &mut state.nodes[pos];

        if node.protocol_version < self.params.min_payments_protocol {
            return Ok(PingOutcome::Ignored);
        }
        if !node.state.is_active() {
            return Err(GossipError::NodeNotActive);
        }
        if let Some(last) = &node.last_ping {
            if ping.sig_time <= last.sig_time {
                return Err(GossipError::StalePing);
            }
        }
        if node.is_pinged_within(MIN_PING_SECONDS - 60, ping.sig_time) {
            return Err(GossipError::PingTooEarly);
        }
        if !ping.verify(&node.pubkey_node) {
            return Err(GossipError::BadPingSignature);
        }

        let block = self
            .chain
            .by_hash(&ping.block_hash)
            .ok_or(GossipError::UnknownBlock(ping.block_hash))?;
        if block.height + PING_MAX_BLOCK_AGE < tip_height {
            return Err(GossipError::BlockTooOld);
        }

        let broadcast_hash = node.to_broadcast().hash();
        node.last_ping = Some(ping.clone());
        node.check(now, true, coins);
        let relay = node.is_enabled();

        if let Some(seen) = state.seen_broadcasts.get_mut(&broadcast_hash) {
            seen.last_ping = Some(ping.clone());
        }
        debug!("Accepted ping for {} {}", self.node_type, ping.collateral);
        Ok(PingOutcome::Accepted { relay })
    }

    /// Serve a list request. Returns the announcement hashes to advertise:
    /// every enabled node, or only the requested one.
    ///
    /// Full-list requests from non-local peers are limited to one per
    /// cooldown window.
    pub fn list_request(
        &self,
        peer: IpAddr,
        is_local: bool,
        collateral: Option<OutPoint>,
    ) -> Result<Vec<Hash>, GossipError> {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if collateral.is_none() && !is_local {
            if let Some(&until) = state.asked_us_for_list.get(&peer) {
                if now < until {
                    return Err(GossipError::ListAlreadyRequested);
                }
            }
            state.asked_us_for_list.insert(peer, now + DSEG_SECONDS);
        }

        let mut hashes = Vec::new();
        for node in state.nodes.iter().filter(|node| node.is_enabled()) {
            if collateral.map_or(true, |wanted| wanted == node.collateral) {
                let broadcast = node.to_broadcast();
                let hash = broadcast.hash();
                state.seen_broadcasts.entry(hash).or_insert(broadcast);
                hashes.push(hash);
                if collateral.is_some() {
                    break;
                }
            }
        }
        Ok(hashes)
    }

    /// Whether to ask a peer for a missing entry. At most one request per
    /// collateral until the ping interval passes.
    pub fn should_ask_for_entry(&self, collateral: &OutPoint) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(&until) = state.we_asked_for_entry.get(collateral) {
            if now < until {
                return false;
            }
        }
        state.we_asked_for_entry.insert(*collateral, now + MIN_PING_SECONDS);
        true
    }

    /// Whether to ask a peer for the full list (non-local peers once per
    /// cooldown window)
    pub fn should_request_list(&self, peer: IpAddr, is_local: bool) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !is_local {
            if let Some(&until) = state.we_asked_for_list.get(&peer) {
                if now < until {
                    return false;
                }
            }
        }
        state.we_asked_for_list.insert(peer, now + DSEG_SECONDS);
        true
    }

    pub fn snapshot(&self) -> RegistryState {
        self.state.lock().clone()
    }

    pub fn restore(&self, restored: RegistryState) {
        *self.state.lock() = restored;
    }
}
