//! Proof-of-stake kernel
//!
//! The kernel hash covers the stake modifier, the pointer outpoint, the
//! collateral amount, the pointer block time and the candidate block time,
//! all little-endian. It is valid when, read as a 256-bit integer, it does
//! not exceed the target.

use primitive_types::U256;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::chain::{BlockIndex, ChainIndex, OutPoint};
use crate::crypto::{hash_bytes, Hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub modifier: Hash,
    pub pointer_time: i64,
    pub stake_time: i64,
}

impl Kernel {
    pub fn new(outpoint: OutPoint, amount: u64, modifier: Hash, pointer_time: i64, stake_time: i64) -> Self {
        Self {
            outpoint,
            amount,
            modifier,
            pointer_time,
            stake_time,
        }
    }

    pub fn hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(32 + 36 + 8 + 8 + 8);
        bytes.extend_from_slice(&self.modifier.0);
        bytes.extend_from_slice(&self.outpoint.to_bytes());
        bytes.extend_from_slice(&self.amount.to_le_bytes());
        bytes.extend_from_slice(&self.pointer_time.to_le_bytes());
        bytes.extend_from_slice(&self.stake_time.to_le_bytes());
        hash_bytes(&bytes)
    }

    pub fn is_valid_proof(&self, target: U256) -> bool {
        self.hash().to_u256() <= target
    }
}

/// Try stake times in `[start, end)`; returns the first time whose kernel
/// meets `target`. The stop flag is checked before every attempt.
pub fn search_time_span(
    kernel: &mut Kernel,
    start: i64,
    end: i64,
    target: U256,
    stop: &AtomicBool,
) -> Option<i64> {
    for time in start..end {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        kernel.stake_time = time;
        if kernel.is_valid_proof(target) {
            return Some(time);
        }
    }
    None
}

/// Modifier for a pointer: hash of the block `offset` blocks below it
pub fn stake_modifier<C: ChainIndex + ?Sized>(
    chain: &C,
    pointer_index: &BlockIndex,
    offset: u64,
) -> Option<Hash> {
    let height = pointer_index.height.checked_sub(offset)?;
    chain
        .ancestor(pointer_index, height)
        .map(|index| index.hash)
}
