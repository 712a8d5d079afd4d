//! Per-network consensus parameters
//!
//! Compiled-in tables; loading parameters from files is not supported.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Base units per coin
pub const COIN: u64 = 100_000_000;

/// Height from which the reduced DarkGravityWave ceiling applies
pub const DGW_REDUCED_LIMIT_HEIGHT: u64 = 1_059_780;

/// Network identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// Consensus parameters the service-node core reads
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub network: Network,
    /// Network magic prefixed to every framed message
    pub magic: [u8; 4],
    pub default_port: u16,

    /// Proof-of-work ceiling (easiest allowed target)
    pub pow_limit: U256,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    pub allow_min_difficulty_blocks: bool,
    pub no_retargeting: bool,
    /// First block height whose work is computed with DarkGravityWave
    pub dgw_start_height: u64,
    /// Testnet keeps retargeting through short histories and the
    /// proof-of-stake transition
    pub dgw_history_exempt: bool,

    pub pos_start_height: u64,
    /// Blocks after which a stake pointer can no longer be used
    pub stake_pointer_validity: u64,
    /// Blocks between a pointer and the block its stake modifier comes from
    pub kernel_modifier_offset: u64,

    pub masternode_collateral: u64,
    pub systemnode_collateral: u64,
    /// Lowest peer protocol eligible for payments and ranking
    pub min_payments_protocol: u32,
}

impl ConsensusParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self::main(),
            Network::Test => Self::test(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn main() -> Self {
        Self {
            network: Network::Main,
            magic: [0xb8, 0xeb, 0xb3, 0xdf],
            default_port: 9340,
            pow_limit: U256::MAX >> 32,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 60,
            allow_min_difficulty_blocks: false,
            no_retargeting: false,
            dgw_start_height: DGW_REDUCED_LIMIT_HEIGHT,
            dgw_history_exempt: false,
            pos_start_height: 2_330_000,
            stake_pointer_validity: 4320,
            kernel_modifier_offset: 100,
            masternode_collateral: 10_000 * COIN,
            systemnode_collateral: 500 * COIN,
            min_payments_protocol: crate::constants::MIN_PAYMENTS_PROTOCOL,
        }
    }

    pub fn test() -> Self {
        Self {
            network: Network::Test,
            magic: [0x0f, 0x18, 0x0e, 0x06],
            default_port: 19340,
            pow_target_timespan: 2 * 24 * 60 * 60,
            pow_target_spacing: 90,
            allow_min_difficulty_blocks: true,
            // last.height >= 140400
            dgw_start_height: 140_401,
            dgw_history_exempt: true,
            pos_start_height: 141_000,
            ..Self::main()
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            pow_limit: U256::MAX >> 1,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 600,
            allow_min_difficulty_blocks: true,
            no_retargeting: true,
            pos_start_height: 200,
            ..Self::main()
        }
    }

    /// Blocks per legacy retarget window
    pub fn difficulty_adjustment_interval(&self) -> u64 {
        (self.pow_target_timespan / self.pow_target_spacing) as u64
    }
}
