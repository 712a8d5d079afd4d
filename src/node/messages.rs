//! Signed gossip payloads: node announcements and pings
//!
//! Signed and hashed content uses an explicit little-endian layout; every
//! payload starts with the node-kind tag so a masternode signature can
//! never be replayed as a systemnode one.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::NodeType;
use crate::chain::OutPoint;
use crate::crypto::{hash_bytes, Hash, PrivateKey, PublicKey, SchnorrSignature};

/// Liveness proof signed with the node's operational key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePing {
    pub node_type: NodeType,
    pub collateral: OutPoint,
    /// Recent block the node saw when pinging
    pub block_hash: Hash,
    pub sig_time: i64,
    pub signature: SchnorrSignature,
}

impl NodePing {
    /// Build and sign a ping
    pub fn new(
        node_type: NodeType,
        collateral: OutPoint,
        block_hash: Hash,
        sig_time: i64,
        operator_key: &PrivateKey,
    ) -> Self {
        let mut ping = Self {
            node_type,
            collateral,
            block_hash,
            sig_time,
            signature: SchnorrSignature::empty(),
        };
        ping.signature = operator_key.sign(&ping.signing_hash());
        ping
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 36 + 32 + 8);
        bytes.push(self.node_type.tag());
        bytes.extend_from_slice(&self.collateral.to_bytes());
        bytes.extend_from_slice(&self.block_hash.0);
        bytes.extend_from_slice(&self.sig_time.to_le_bytes());
        bytes
    }

    pub fn signing_hash(&self) -> Hash {
        hash_bytes(&self.signing_bytes())
    }

    /// Content hash (seen-set and inventory key)
    pub fn hash(&self) -> Hash {
        let mut bytes = self.signing_bytes();
        bytes.extend_from_slice(&self.signature.0);
        hash_bytes(&bytes)
    }

    pub fn verify(&self, operator_key: &PublicKey) -> bool {
        operator_key.verify(&self.signing_hash(), &self.signature)
    }
}

/// Node announcement signed with the collateral-owning identity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub node_type: NodeType,
    pub collateral: OutPoint,
    pub addr: SocketAddr,
    /// Key the collateral output pays
    pub pubkey_collateral: PublicKey,
    /// Operational key that signs pings
    pub pubkey_node: PublicKey,
    pub signature: SchnorrSignature,
    pub sig_time: i64,
    pub protocol_version: u32,
    /// Not covered by the signature or the content hash
    pub last_ping: Option<NodePing>,
}

impl Broadcast {
    /// Build and sign an announcement
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_type: NodeType,
        collateral: OutPoint,
        addr: SocketAddr,
        collateral_key: &PrivateKey,
        pubkey_node: PublicKey,
        sig_time: i64,
        protocol_version: u32,
        last_ping: Option<NodePing>,
    ) -> Self {
        let mut broadcast = Self {
            node_type,
            collateral,
            addr,
            pubkey_collateral: collateral_key.public_key(),
            pubkey_node,
            signature: SchnorrSignature::empty(),
            sig_time,
            protocol_version,
            last_ping,
        };
        broadcast.signature = collateral_key.sign(&broadcast.signing_hash());
        broadcast
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let addr = self.addr.to_string();
        let mut bytes = Vec::with_capacity(1 + 36 + 4 + addr.len() + 64 + 8 + 4);
        bytes.push(self.node_type.tag());
        bytes.extend_from_slice(&self.collateral.to_bytes());
        bytes.extend_from_slice(&(addr.len() as u32).to_le_bytes());
        bytes.extend_from_slice(addr.as_bytes());
        bytes.extend_from_slice(&self.pubkey_collateral.0);
        bytes.extend_from_slice(&self.pubkey_node.0);
        bytes.extend_from_slice(&self.sig_time.to_le_bytes());
        bytes.extend_from_slice(&self.protocol_version.to_le_bytes());
        bytes
    }

    pub fn signing_hash(&self) -> Hash {
        hash_bytes(&self.signing_bytes())
    }

    /// Content hash (seen-set and inventory key)
    pub fn hash(&self) -> Hash {
        let mut bytes = self.signing_bytes();
        bytes.extend_from_slice(&self.signature.0);
        hash_bytes(&bytes)
    }

    pub fn verify(&self) -> bool {
        self.pubkey_collateral
            .verify(&self.signing_hash(), &self.signature)
    }
}
