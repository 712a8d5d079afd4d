//! Difficulty adjustment
//!
//! Two algorithms, selected by height and network:
//! - legacy interval retarget (rescale once per adjustment window)
//! - DarkGravityWave (weighted average over the last 24 blocks)
//!
//! Both are pure functions of ancestor headers and consensus parameters.
//! A missing ancestor that the chain index must have is corrupted state
//! and panics.

use primitive_types::{U256, U512};

use super::{decode_compact, encode_compact, ConsensusParams, DGW_REDUCED_LIMIT_HEIGHT};
use crate::chain::{BlockIndex, ChainIndex};

/// Blocks averaged by DarkGravityWave
const DGW_PAST_BLOCKS: u64 = 24;

/// Maximum adjustment factor of the legacy retarget (4x in either direction)
const MAX_ADJUSTMENT_FACTOR: i64 = 4;

/// DarkGravityWave clamp (3x in either direction)
const DGW_ADJUSTMENT_FACTOR: i64 = 3;

/// Compute the compact target required for the block after `last`.
///
/// `new_block_time` is the timestamp of the block being built or validated;
/// only the legacy min-difficulty rule reads it.
pub fn get_next_work_required<C: ChainIndex + ?Sized>(
    chain: &C,
    last: &BlockIndex,
    new_block_time: i64,
    params: &ConsensusParams,
) -> u32 {
    if last.height + 1 >= params.dgw_start_height {
        return dark_gravity_wave(chain, last, params);
    }

    let pow_limit = encode_compact(params.pow_limit);
    let interval = params.difficulty_adjustment_interval();

    // Only change once per adjustment window
    if (last.height + 1) % interval != 0 {
        if params.allow_min_difficulty_blocks {
            if new_block_time > last.time + params.pow_target_spacing * 2 {
                return pow_limit;
            }
            // Last block not mined under the min-difficulty exception
            let mut index = last.clone();
            while index.height % interval != 0 && index.bits == pow_limit {
                match chain.prev(&index) {
                    Some(prev) => index = prev,
                    None => break,
                }
            }
            return index.bits;
        }
        return last.bits;
    }

    let first_height = last
        .height
        .checked_sub(interval - 1)
        .expect("retarget window starts before genesis");
    let first = chain
        .ancestor(last, first_height)
        .unwrap_or_else(|| panic!("missing ancestor at height {} of {}", first_height, last.hash));

    calculate_next_work_required(last, first.time, params)
}

/// Legacy retarget: rescale the last target by the clamped window timespan
pub fn calculate_next_work_required(
    last: &BlockIndex,
    first_block_time: i64,
    params: &ConsensusParams,
) -> u32 {
    if params.no_retargeting {
        return last.bits;
    }

    let timespan = params.pow_target_timespan;
    let actual = (last.time - first_block_time)
        .max(timespan / MAX_ADJUSTMENT_FACTOR)
        .min(timespan * MAX_ADJUSTMENT_FACTOR);

    let current = decode_compact(last.bits).value;
    let retargeted = scale_target(current, actual, timespan);

    encode_compact(retargeted.min(params.pow_limit))
}

/// DarkGravityWave v3
pub fn dark_gravity_wave<C: ChainIndex + ?Sized>(
    chain: &C,
    last: &BlockIndex,
    params: &ConsensusParams,
) -> u32 {
    let pow_limit = if last.height >= DGW_REDUCED_LIMIT_HEIGHT {
        U256::from(0x03ffffu64) << 216
    } else {
        params.pow_limit
    };

    // Bootstrap window around the proof-of-stake switch
    let pos_start = params.pos_start_height;
    let transition = last.height + 1 >= pos_start && last.height < pos_start + DGW_PAST_BLOCKS;
    let short_history = last.height < DGW_PAST_BLOCKS && !params.dgw_history_exempt;
    if last.height == 0 || transition || short_history {
        return encode_compact(pow_limit);
    }

    let mut reading = last.clone();
    let mut count: u64 = 0;
    let mut average = U256::zero();
    let mut actual_timespan: i64 = 0;
    let mut last_block_time: i64 = 0;

    while reading.height > 0 && count < DGW_PAST_BLOCKS {
        count += 1;

        let target = decode_compact(reading.bits).value;
        average = if count == 1 {
            target
        } else {
            // (prev * count + new) / (count + 1)
            let weighted = U512::from(average) * U512::from(count) + U512::from(target);
            truncate(weighted / U512::from(count + 1))
        };

        if last_block_time > 0 {
            actual_timespan += last_block_time - reading.time;
        }
        last_block_time = reading.time;

        reading = chain
            .prev(&reading)
            .unwrap_or_else(|| panic!("missing parent of block {} at height {}", reading.hash, reading.height));
    }

    let target_timespan = count as i64 * params.pow_target_spacing;
    let actual_timespan = actual_timespan
        .max(target_timespan / DGW_ADJUSTMENT_FACTOR)
        .min(target_timespan * DGW_ADJUSTMENT_FACTOR);

    let retargeted = scale_target(average, actual_timespan, target_timespan);
    encode_compact(retargeted.min(pow_limit))
}

/// `target * numerator / denominator` without intermediate overflow
fn scale_target(target: U256, numerator: i64, denominator: i64) -> U256 {
    let product = target.full_mul(U256::from(numerator.max(0) as u64));
    let quotient = product / U512::from(denominator.max(1) as u64);
    if quotient > U512::from(U256::MAX) {
        U256::MAX
    } else {
        truncate(quotient)
    }
}

fn truncate(value: U512) -> U256 {
    U256::try_from(value).unwrap_or(U256::MAX)
}
