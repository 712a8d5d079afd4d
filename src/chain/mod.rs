//! Chain module - primitives and the chain-side collaborators the
//! service-node core depends on.
//!
//! The full ledger, script system and block validation live outside this
//! crate; the traits here are the narrow contracts the registry, payment
//! queue, stake minter and difficulty code need from them.

mod block;
mod memory;

pub use block::*;
pub use memory::*;

use thiserror::Error;

use crate::crypto::Hash;

/// Failures reported by chain collaborators
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Block {0} not found")]
    BlockNotFound(Hash),
}

/// Block-index lookups on the active chain, with ancestor traversal
pub trait ChainIndex: Send + Sync {
    fn tip(&self) -> Option<BlockIndex>;

    /// Block at `height` on the active chain
    fn at_height(&self, height: u64) -> Option<BlockIndex>;

    /// Any indexed block, active or not
    fn by_hash(&self, hash: &Hash) -> Option<BlockIndex>;

    fn height(&self) -> u64 {
        self.tip().map(|tip| tip.height).unwrap_or(0)
    }

    fn block_hash(&self, height: u64) -> Option<Hash> {
        self.at_height(height).map(|index| index.hash)
    }

    fn prev(&self, index: &BlockIndex) -> Option<BlockIndex> {
        if index.height == 0 {
            return None;
        }
        self.by_hash(&index.prev_hash)
    }

    /// Ancestor of `index` at `height` (walks back through `prev`)
    fn ancestor(&self, index: &BlockIndex, height: u64) -> Option<BlockIndex> {
        if height > index.height {
            return None;
        }
        let mut current = index.clone();
        while current.height > height {
            current = self.prev(&current)?;
        }
        Some(current)
    }
}

/// Full block reads (may hit disk)
pub trait BlockSource: Send + Sync {
    fn read_block(&self, index: &BlockIndex) -> Result<Block, ChainError>;
}

/// State of a collateral output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralInfo {
    pub output: TxOut,
    /// Height of the block that created the output
    pub height: u64,
    pub spent: bool,
}

/// Collateral-output lookups
pub trait CollateralView: Send + Sync {
    fn collateral(&self, outpoint: &OutPoint) -> Option<CollateralInfo>;

    /// Unknown outputs count as spent
    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.collateral(outpoint).map(|info| info.spent).unwrap_or(true)
    }

    /// Confirmations of an unspent output against the current tip
    fn input_age(&self, outpoint: &OutPoint, tip_height: u64) -> Option<u64> {
        self.collateral(outpoint)
            .filter(|info| !info.spent && info.height <= tip_height)
            .map(|info| tip_height - info.height + 1)
    }
}

/// Reward-payment history of payees (by pubkey hash and coinbase slot)
pub trait PaymentHistory: Send + Sync {
    /// Whether the payee already holds a payment slot in the window
    /// starting at `height`
    fn is_scheduled(&self, pubkey_hash: &Hash, height: u64) -> bool;

    /// Time of the most recent block that paid the payee at `slot`
    fn last_paid_time(&self, pubkey_hash: &Hash, slot: usize) -> Option<i64>;

    /// Blocks within `depth` of the tip whose coinbase pays the payee at
    /// `slot`, newest first
    fn recent_payment_blocks(&self, pubkey_hash: &Hash, slot: usize, depth: u64) -> Vec<BlockIndex>;
}

/// Budget (superblock) schedule
pub trait BudgetSchedule: Send + Sync {
    fn is_budget_payment_block(&self, height: u64) -> bool;
}
