//! Stake pointers and the set of pointers already used

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::chain::OutPoint;
use crate::crypto::{Hash, PublicKey};

/// Reward output paid to a node, used as the anchor of a stake kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakePointer {
    /// Block whose coinbase made the payment
    pub block_hash: Hash,
    pub txid: Hash,
    /// Coinbase output index (the node kind's payment slot)
    pub index: u32,
    /// Key the payment went to
    pub pubkey: PublicKey,
}

impl StakePointer {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.index)
    }

    /// Key in the used-pointer set
    pub fn hash(&self) -> Hash {
        self.outpoint().hash()
    }
}

/// Pointers consumed by a successful kernel; each may be used once
#[derive(Debug, Default)]
pub struct UsedPointers(Mutex<HashSet<Hash>>);

impl UsedPointers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.0.lock().contains(hash)
    }

    /// Returns false if the pointer was already used
    pub fn mark(&self, hash: Hash) -> bool {
        self.0.lock().insert(hash)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = self.0.lock().iter().copied().collect();
        hashes.sort();
        hashes
    }

    pub fn restore(&self, hashes: Vec<Hash>) {
        *self.0.lock() = hashes.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_bytes, PrivateKey};

    #[test]
    fn test_pointer_used_once() {
        let pointer = StakePointer {
            block_hash: hash_bytes(b"block"),
            txid: hash_bytes(b"coinbase"),
            index: 2,
            pubkey: PrivateKey::generate().public_key(),
        };
        let used = UsedPointers::new();

        assert!(!used.contains(&pointer.hash()));
        assert!(used.mark(pointer.hash()));
        assert!(!used.mark(pointer.hash()));
        assert!(used.contains(&pointer.hash()));
        assert_eq!(pointer.hash(), OutPoint::new(pointer.txid, 2).hash());
    }

    #[test]
    fn test_snapshot_restore() {
        let used = UsedPointers::new();
        used.mark(hash_bytes(b"a"));
        used.mark(hash_bytes(b"b"));

        let restored = UsedPointers::new();
        restored.restore(used.snapshot());
        assert_eq!(restored.len(), 2);
        assert!(restored.contains(&hash_bytes(b"a")));
    }
}
