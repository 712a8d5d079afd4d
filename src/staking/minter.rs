//! Stake kernel search for the locally operated service node
//!
//! Runs on its own thread: the search is CPU-bound and only leaves its
//! loop to consult the used-pointer set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::{search_time_span, stake_modifier, Kernel, StakePointer, UsedPointers};
use crate::chain::{
    BlockSource, BudgetSchedule, ChainError, ChainIndex, CollateralView, OutPoint, PaymentHistory,
};
use crate::consensus::{target_from_compact, ConsensusParams};
use crate::crypto::Hash;
use crate::node::{NodeType, ServiceNode};

/// Stake times tried per call
pub const STAKE_SEARCH_INTERVAL: i64 = 30;
/// Pointers must be at least this deep to survive a reorganisation
pub const MAX_REORG_DEPTH: u64 = 100;

#[derive(Debug, Error)]
pub enum StakeError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Everything the minter reads from the chain
pub trait StakeChain: ChainIndex + BlockSource + CollateralView + PaymentHistory + BudgetSchedule {}

impl<T> StakeChain for T where T: ChainIndex + BlockSource + CollateralView + PaymentHistory + BudgetSchedule {}

/// A successful kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinStake {
    pub pointer: StakePointer,
    pub stake_time: i64,
    pub kernel_hash: Hash,
    /// Collateral of the staking node
    pub collateral: OutPoint,
    /// Pubkey hash the stake reward goes to
    pub payee: Hash,
}

#[derive(Debug)]
pub enum StakeResult {
    Found(CoinStake),
    /// No pointer produced a kernel in this window; retry next round
    NotFound,
    Interrupted,
}

pub struct StakeMinter {
    node_type: NodeType,
    params: Arc<ConsensusParams>,
    chain: Arc<dyn StakeChain>,
    used: Arc<UsedPointers>,
    stop_signal: Arc<AtomicBool>,
    search_interval: i64,
}

impl StakeMinter {
    pub fn new(
        node_type: NodeType,
        params: Arc<ConsensusParams>,
        chain: Arc<dyn StakeChain>,
        used: Arc<UsedPointers>,
    ) -> Self {
        Self {
            node_type,
            params,
            chain,
            used,
            stop_signal: Arc::new(AtomicBool::new(false)),
            search_interval: STAKE_SEARCH_INTERVAL,
        }
    }

    pub fn with_search_interval(mut self, seconds: i64) -> Self {
        self.search_interval = seconds;
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn used_pointers(&self) -> &Arc<UsedPointers> {
        &self.used
    }

    /// Get a stop signal handle
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Unused pointers from the node's recent payments, newest first.
    /// Budget blocks and blocks shallower than the reorg margin are skipped.
    pub fn recent_stake_pointers(&self, node: &ServiceNode) -> Result<Vec<StakePointer>, StakeError> {
        let payee = node.pubkey_collateral.pubkey_hash();
        let slot = self.node_type.payment_slot();
        let tip_height = self.chain.height();

        let mut pointers = Vec::new();
        let paid_blocks = self
            .chain
            .recent_payment_blocks(&payee, slot, self.params.stake_pointer_validity);

        for index in paid_blocks {
            if self.chain.is_budget_payment_block(index.height) {
                continue;
            }
            if tip_height.saturating_sub(index.height) < MAX_REORG_DEPTH {
                continue;
            }

            let block = self.chain.read_block(&index)?;
            for tx in block.transactions.iter().filter(|tx| tx.is_coinbase()) {
                let pays_node = tx
                    .outputs
                    .get(slot)
                    .map(|output| output.pubkey_hash == payee)
                    .unwrap_or(false);
                if !pays_node {
                    continue;
                }

                let pointer = StakePointer {
                    block_hash: index.hash,
                    txid: tx.hash(),
                    index: slot as u32,
                    pubkey: node.pubkey_collateral.clone(),
                };
                if !self.used.contains(&pointer.hash()) {
                    pointers.push(pointer);
                }
            }
        }
        Ok(pointers)
    }

    /// Search for a kernel for a block at `height` with compact target
    /// `bits`, trying stake times from `time` on. The first pointer with a
    /// hit wins and is marked used.
    pub fn create_coin_stake(
        &self,
        height: u64,
        bits: u32,
        time: i64,
        node: &ServiceNode,
    ) -> Result<StakeResult, StakeError> {
        let pointers = self.recent_stake_pointers(node)?;
        if pointers.is_empty() {
            debug!("No stake pointers for {} {}", self.node_type, node.collateral);
            return Ok(StakeResult::NotFound);
        }

        let tip_height = self.chain.height();
        let input_age = match self.chain.input_age(&node.collateral, tip_height) {
            Some(age) => age,
            None => return Ok(StakeResult::NotFound),
        };
        let active_input_height = tip_height as i64 - input_age as i64;
        let amount = self.node_type.collateral(&self.params);
        let offset = self.params.kernel_modifier_offset;
        let target = target_from_compact(bits);

        for pointer in pointers {
            if self.is_stopped() {
                return Ok(StakeResult::Interrupted);
            }

            let index = match self.chain.by_hash(&pointer.block_hash) {
                Some(index) => index,
                None => continue,
            };
            if height.saturating_sub(index.height) >= self.params.stake_pointer_validity + 1 {
                continue;
            }
            // The collateral must predate the modifier block
            if index.height as i64 - offset as i64 <= active_input_height {
                continue;
            }
            let modifier = match stake_modifier(self.chain.as_ref(), &index, offset) {
                Some(modifier) => modifier,
                None => continue,
            };

            let mut kernel = Kernel::new(pointer.outpoint(), amount, modifier, index.time, time);
            match search_time_span(&mut kernel, time, time + self.search_interval, target, &self.stop_signal) {
                Some(stake_time) => {
                    self.used.mark(pointer.hash());
                    info!(
                        "Found stake kernel for {} {} at time {}",
                        self.node_type, node.collateral, stake_time
                    );
                    return Ok(StakeResult::Found(CoinStake {
                        kernel_hash: kernel.hash(),
                        pointer,
                        stake_time,
                        collateral: node.collateral,
                        payee: node.pubkey_collateral.pubkey_hash(),
                    }));
                }
                None if self.is_stopped() => return Ok(StakeResult::Interrupted),
                None => {}
            }
        }

        Ok(StakeResult::NotFound)
    }

    /// Recompute a found kernel from the chain and check it against `bits`
    pub fn verify_kernel(&self, stake: &CoinStake, bits: u32) -> bool {
        let index = match self.chain.by_hash(&stake.pointer.block_hash) {
            Some(index) => index,
            None => return false,
        };
        let modifier = match stake_modifier(self.chain.as_ref(), &index, self.params.kernel_modifier_offset) {
            Some(modifier) => modifier,
            None => return false,
        };

        let kernel = Kernel::new(
            stake.pointer.outpoint(),
            self.node_type.collateral(&self.params),
            modifier,
            index.time,
            stake.stake_time,
        );
        kernel.hash() == stake.kernel_hash && kernel.is_valid_proof(target_from_compact(bits))
    }
}
