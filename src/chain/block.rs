//! Block, transaction and block-index primitives
//!
//! Only the parts the service-node core reads are modelled: coinbase
//! payouts (stake pointers, payment history), collateral outputs, and
//! header fields used for difficulty and kernel checks.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{compute_merkle_root, hash_bytes, Hash};

/// Reference to a transaction output: (transaction id, output index)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint (coinbase inputs, "whole list" requests)
    pub const fn null() -> Self {
        Self {
            txid: Hash::zero(),
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }

    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[..32].copy_from_slice(&self.txid.0);
        bytes[32..].copy_from_slice(&self.index.to_le_bytes());
        bytes
    }

    /// Digest identifying this outpoint (stake-pointer bookkeeping)
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.to_bytes())
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutPoint({}-{})", self.txid, self.index)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", &self.txid.to_hex()[..16], self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Amount in base units
    pub amount: u64,
    /// Public key hash of the recipient
    pub pubkey_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Block reward transaction; the height keeps coinbase ids unique
    pub fn coinbase(height: u64, outputs: Vec<TxOut>) -> Self {
        Self {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
            }],
            outputs,
            lock_time: height as u32,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn hash(&self) -> Hash {
        hash_bytes(&self.to_bytes())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(&input.prevout.to_bytes());
        }
        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            bytes.extend_from_slice(&output.amount.to_le_bytes());
            bytes.extend_from_slice(&output.pubkey_hash.0);
        }
        bytes.extend_from_slice(&self.lock_time.to_le_bytes());
        bytes
    }
}

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash,
    pub merkle_root: Hash,
    /// Seconds since Unix epoch
    pub timestamp: i64,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(88);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.prev_hash.0);
        bytes.extend_from_slice(&self.merkle_root.0);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.bits.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    pub fn hash(&self) -> Hash {
        hash_bytes(&self.to_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block on top of `prev_hash`, committing to `transactions`
    pub fn assemble(prev_hash: Hash, timestamp: i64, bits: u32, transactions: Vec<Transaction>) -> Self {
        let txids: Vec<Hash> = transactions.iter().map(|tx| tx.hash()).collect();
        let header = BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: compute_merkle_root(&txids),
            timestamp,
            bits,
            nonce: 0,
        };
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}

/// Summary of a block as seen by the chain index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub height: u64,
    pub hash: Hash,
    pub prev_hash: Hash,
    pub time: i64,
    pub bits: u32,
}

impl BlockIndex {
    pub fn from_header(header: &BlockHeader, height: u64) -> Self {
        Self {
            height,
            hash: header.hash(),
            prev_hash: header.prev_hash,
            time: header.timestamp,
            bits: header.bits,
        }
    }
}
