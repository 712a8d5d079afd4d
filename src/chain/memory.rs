//! In-memory chain
//!
//! Tracks a block index (hash -> summary), the active chain, the output
//! set and the payment schedule. Backs the collaborator traits for the
//! node binary on regtest and for tests.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::{
    Block, BlockIndex, BlockSource, BudgetSchedule, ChainError, ChainIndex, CollateralInfo,
    CollateralView, OutPoint, PaymentHistory, Transaction, TxOut,
};
use crate::crypto::Hash;

/// Blocks ahead of `height` that count as "already scheduled"
const SCHEDULE_LOOKAHEAD: u64 = 8;

#[derive(Debug, Default)]
struct ChainInner {
    index: HashMap<Hash, BlockIndex>,
    blocks: HashMap<Hash, Block>,
    active: Vec<Hash>,
    coins: HashMap<OutPoint, CollateralInfo>,
    scheduled: HashMap<Hash, BTreeSet<u64>>,
    budget_heights: HashSet<u64>,
}

impl ChainInner {
    fn tip(&self) -> Option<&BlockIndex> {
        self.active.last().and_then(|hash| self.index.get(hash))
    }

    fn apply_transactions(&mut self, block: &Block, height: u64) {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    if let Some(coin) = self.coins.get_mut(&input.prevout) {
                        coin.spent = true;
                    }
                }
            }

            let txid = tx.hash();
            for (index, output) in tx.outputs.iter().enumerate() {
                self.coins.insert(
                    OutPoint::new(txid, index as u32),
                    CollateralInfo {
                        output: output.clone(),
                        height,
                        spent: false,
                    },
                );
            }
        }
    }
}

/// Thread-safe in-memory chain
#[derive(Debug)]
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    /// Create a chain from its genesis block
    pub fn new(genesis: Block) -> Self {
        let mut inner = ChainInner::default();
        let index = BlockIndex::from_header(&genesis.header, 0);
        inner.apply_transactions(&genesis, 0);
        inner.active.push(index.hash);
        inner.index.insert(index.hash, index);
        inner.blocks.insert(genesis.hash(), genesis);

        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Chain with an empty genesis block
    pub fn with_genesis(timestamp: i64, bits: u32) -> Self {
        let genesis = Block::assemble(
            Hash::zero(),
            timestamp,
            bits,
            vec![Transaction::coinbase(0, Vec::new())],
        );
        Self::new(genesis)
    }

    /// Index a block. It extends the active chain when it builds on the tip;
    /// otherwise it is only indexed (side branch).
    pub fn push_block(&self, block: Block) -> Result<BlockIndex, ChainError> {
        let mut inner = self.inner.write();
        let prev = inner
            .index
            .get(&block.header.prev_hash)
            .cloned()
            .ok_or(ChainError::BlockNotFound(block.header.prev_hash))?;

        let index = BlockIndex::from_header(&block.header, prev.height + 1);
        let extends_tip = inner.tip().map(|tip| tip.hash) == Some(prev.hash);
        if extends_tip {
            inner.apply_transactions(&block, index.height);
            inner.active.push(index.hash);
        }
        inner.index.insert(index.hash, index.clone());
        inner.blocks.insert(index.hash, block);
        Ok(index)
    }

    /// Build and append a block on the tip whose coinbase pays `payouts`
    /// (slot order), followed by `transactions`
    pub fn append_block(
        &self,
        timestamp: i64,
        bits: u32,
        payouts: Vec<TxOut>,
        transactions: Vec<Transaction>,
    ) -> Result<BlockIndex, ChainError> {
        let (prev_hash, height) = {
            let inner = self.inner.read();
            let tip = inner.tip().ok_or(ChainError::BlockNotFound(Hash::zero()))?;
            (tip.hash, tip.height + 1)
        };

        let mut txs = vec![Transaction::coinbase(height, payouts)];
        txs.extend(transactions);
        self.push_block(Block::assemble(prev_hash, timestamp, bits, txs))
    }

    /// Register an output directly (fixtures and imported state)
    pub fn insert_coin(&self, outpoint: OutPoint, output: TxOut, height: u64) {
        self.inner.write().coins.insert(
            outpoint,
            CollateralInfo {
                output,
                height,
                spent: false,
            },
        );
    }

    pub fn spend_coin(&self, outpoint: &OutPoint) {
        if let Some(coin) = self.inner.write().coins.get_mut(outpoint) {
            coin.spent = true;
        }
    }

    /// Record that the payee is the elected winner at `height`
    pub fn schedule_payee(&self, pubkey_hash: Hash, height: u64) {
        self.inner
            .write()
            .scheduled
            .entry(pubkey_hash)
            .or_default()
            .insert(height);
    }

    pub fn mark_budget_block(&self, height: u64) {
        self.inner.write().budget_heights.insert(height);
    }
}

impl ChainIndex for MemoryChain {
    fn tip(&self) -> Option<BlockIndex> {
        self.inner.read().tip().cloned()
    }

    fn at_height(&self, height: u64) -> Option<BlockIndex> {
        let inner = self.inner.read();
        let hash = inner.active.get(height as usize)?;
        inner.index.get(hash).cloned()
    }

    fn by_hash(&self, hash: &Hash) -> Option<BlockIndex> {
        self.inner.read().index.get(hash).cloned()
    }

    fn ancestor(&self, index: &BlockIndex, height: u64) -> Option<BlockIndex> {
        if height > index.height {
            return None;
        }
        // Shortcut for blocks on the active chain
        if self.block_hash(index.height) == Some(index.hash) {
            return self.at_height(height);
        }
        let mut current = index.clone();
        while current.height > height {
            current = self.prev(&current)?;
        }
        Some(current)
    }
}

impl BlockSource for MemoryChain {
    fn read_block(&self, index: &BlockIndex) -> Result<Block, ChainError> {
        self.inner
            .read()
            .blocks
            .get(&index.hash)
            .cloned()
            .ok_or(ChainError::BlockNotFound(index.hash))
    }
}

impl CollateralView for MemoryChain {
    fn collateral(&self, outpoint: &OutPoint) -> Option<CollateralInfo> {
        self.inner.read().coins.get(outpoint).cloned()
    }
}

impl PaymentHistory for MemoryChain {
    fn is_scheduled(&self, pubkey_hash: &Hash, height: u64) -> bool {
        self.inner
            .read()
            .scheduled
            .get(pubkey_hash)
            .map(|heights| heights.range(height..=height + SCHEDULE_LOOKAHEAD).next().is_some())
            .unwrap_or(false)
    }

    fn last_paid_time(&self, pubkey_hash: &Hash, slot: usize) -> Option<i64> {
        let depth = self.height();
        self.recent_payment_blocks(pubkey_hash, slot, depth)
            .first()
            .map(|index| index.time)
    }

    fn recent_payment_blocks(&self, pubkey_hash: &Hash, slot: usize, depth: u64) -> Vec<BlockIndex> {
        let inner = self.inner.read();
        let tip_height = match inner.tip() {
            Some(tip) => tip.height,
            None => return Vec::new(),
        };
        let lowest = tip_height.saturating_sub(depth);

        (lowest..=tip_height)
            .rev()
            .filter_map(|height| inner.active.get(height as usize))
            .filter(|hash| {
                inner
                    .blocks
                    .get(*hash)
                    .and_then(|block| block.coinbase())
                    .and_then(|coinbase| coinbase.outputs.get(slot))
                    .map(|out| out.pubkey_hash == *pubkey_hash)
                    .unwrap_or(false)
            })
            .filter_map(|hash| inner.index.get(hash).cloned())
            .collect()
    }
}

impl BudgetSchedule for MemoryChain {
    fn is_budget_payment_block(&self, height: u64) -> bool {
        self.inner.read().budget_heights.contains(&height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxIn;
    use crate::crypto::hash_bytes;

    fn payout(tag: &[u8]) -> TxOut {
        TxOut {
            amount: 100,
            pubkey_hash: hash_bytes(tag),
        }
    }

    #[test]
    fn test_append_extends_active_chain() {
        let chain = MemoryChain::with_genesis(1_000, 0x207fffff);
        let first = chain.append_block(1_060, 0x207fffff, vec![], vec![]).unwrap();
        let second = chain.append_block(1_120, 0x207fffff, vec![], vec![]).unwrap();

        assert_eq!(chain.height(), 2);
        assert_eq!(chain.block_hash(1), Some(first.hash));
        assert_eq!(chain.prev(&second), Some(first.clone()));
        assert_eq!(chain.ancestor(&second, 0).map(|b| b.height), Some(0));
    }

    #[test]
    fn test_side_branch_is_indexed_but_not_active() {
        let chain = MemoryChain::with_genesis(1_000, 0x207fffff);
        let genesis = chain.at_height(0).unwrap();
        chain.append_block(1_060, 0x207fffff, vec![], vec![]).unwrap();

        let side = Block::assemble(genesis.hash, 1_061, 0x207fffff, vec![Transaction::coinbase(1, vec![])]);
        let side_index = chain.push_block(side).unwrap();

        assert_eq!(chain.height(), 1);
        assert!(chain.by_hash(&side_index.hash).is_some());
        assert_ne!(chain.block_hash(1), Some(side_index.hash));
        assert_eq!(chain.ancestor(&side_index, 0), Some(genesis));
    }

    #[test]
    fn test_spending_marks_collateral() {
        let chain = MemoryChain::with_genesis(1_000, 0x207fffff);
        let funding = Transaction::new(vec![], vec![payout(b"owner")]);
        let outpoint = OutPoint::new(funding.hash(), 0);
        chain.append_block(1_060, 0x207fffff, vec![], vec![funding]).unwrap();

        assert!(!chain.is_spent(&outpoint));
        assert_eq!(chain.input_age(&outpoint, 1), Some(1));

        let spend = Transaction::new(vec![TxIn { prevout: outpoint }], vec![payout(b"next")]);
        chain.append_block(1_120, 0x207fffff, vec![], vec![spend]).unwrap();
        assert!(chain.is_spent(&outpoint));
        assert_eq!(chain.input_age(&outpoint, 2), None);
    }

    #[test]
    fn test_payment_history_by_slot() {
        let chain = MemoryChain::with_genesis(1_000, 0x207fffff);
        let payee = payout(b"payee");
        chain.append_block(1_060, 0x207fffff, vec![payout(b"miner"), payee.clone()], vec![]).unwrap();
        chain.append_block(1_120, 0x207fffff, vec![payout(b"miner")], vec![]).unwrap();

        let blocks = chain.recent_payment_blocks(&payee.pubkey_hash, 1, 10);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].height, 1);
        assert_eq!(chain.last_paid_time(&payee.pubkey_hash, 1), Some(1_060));
        assert_eq!(chain.last_paid_time(&payee.pubkey_hash, 2), None);
    }

    #[test]
    fn test_schedule_window() {
        let chain = MemoryChain::with_genesis(1_000, 0x207fffff);
        let payee = hash_bytes(b"payee");
        chain.schedule_payee(payee, 105);

        assert!(chain.is_scheduled(&payee, 100));
        assert!(chain.is_scheduled(&payee, 97));
        assert!(!chain.is_scheduled(&payee, 96));
        assert!(!chain.is_scheduled(&payee, 106));
    }
}
