//! Shared fixtures: an in-memory chain, a manual clock and funded operators

#![allow(dead_code)]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

use snode_core::chain::{ChainIndex, MemoryChain, OutPoint, TxOut};
use snode_core::consensus::ConsensusParams;
use snode_core::crypto::{hash_bytes, PrivateKey};
use snode_core::node::{Broadcast, NodePing, NodeType, Registry};
use snode_core::p2p::{InvItem, Message, PeerId, PeerNetwork};
use snode_core::time::ManualClock;

pub const START: i64 = 1_700_000_000;
pub const BITS: u32 = 0x207fffff;

pub struct TestChain {
    pub chain: Arc<MemoryChain>,
    pub clock: Arc<ManualClock>,
    pub params: Arc<ConsensusParams>,
}

impl TestChain {
    /// Regtest chain of `blocks` blocks one minute apart, ending well
    /// before `START`
    pub fn new(blocks: u64) -> Self {
        let chain = Arc::new(MemoryChain::with_genesis(START - 200_000, BITS));
        for height in 1..=blocks {
            chain
                .append_block(START - 200_000 + height as i64 * 60, BITS, vec![], vec![])
                .unwrap();
        }
        Self {
            chain,
            clock: Arc::new(ManualClock::new(START)),
            params: Arc::new(ConsensusParams::regtest()),
        }
    }

    pub fn registry(&self, node_type: NodeType) -> Arc<Registry> {
        Arc::new(Registry::new(
            node_type,
            self.params.clone(),
            self.chain.clone(),
            self.chain.clone(),
            self.clock.clone(),
        ))
    }

    /// Operator whose collateral confirmed at height 1
    pub fn fund(&self, node_type: NodeType, seed: u32) -> Operator {
        let owner = PrivateKey::generate();
        let collateral = OutPoint::new(hash_bytes(&seed.to_le_bytes()), 0);
        self.chain.insert_coin(
            collateral,
            TxOut {
                amount: node_type.collateral(&self.params),
                pubkey_hash: owner.public_key().pubkey_hash(),
            },
            1,
        );
        Operator {
            node_type,
            owner,
            operator: PrivateKey::generate(),
            collateral,
            addr: format!("10.{}.{}.{}:18444", seed / 65_536 % 256, seed / 256 % 256, seed % 256)
                .parse()
                .unwrap(),
        }
    }

    pub fn tip_hash(&self) -> snode_core::crypto::Hash {
        self.chain.tip().unwrap().hash
    }
}

pub struct Operator {
    pub node_type: NodeType,
    pub owner: PrivateKey,
    pub operator: PrivateKey,
    pub collateral: OutPoint,
    pub addr: SocketAddr,
}

impl Operator {
    pub fn ping(&self, chain: &TestChain, sig_time: i64) -> NodePing {
        NodePing::new(self.node_type, self.collateral, chain.tip_hash(), sig_time, &self.operator)
    }

    pub fn broadcast(&self, chain: &TestChain, sig_time: i64, ping_time: i64, protocol: u32) -> Broadcast {
        Broadcast::new(
            self.node_type,
            self.collateral,
            self.addr,
            &self.owner,
            self.operator.public_key(),
            sig_time,
            protocol,
            Some(self.ping(chain, ping_time)),
        )
    }

    /// Announcement signed an hour ago with a ping from a minute ago
    pub fn announce(&self, chain: &TestChain) -> Broadcast {
        self.broadcast(chain, START - 3600, START - 60, snode_core::constants::PROTOCOL_VERSION)
    }
}

/// Network stand-in that records what the handler sends
#[derive(Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<(PeerId, Message)>>,
    pub relayed: Mutex<Vec<InvItem>>,
}

impl PeerNetwork for Recorder {
    fn send(&self, peer: &PeerId, message: Message) {
        self.sent.lock().push((*peer, message));
    }

    fn relay_inv(&self, item: InvItem) {
        self.relayed.lock().push(item);
    }
}
