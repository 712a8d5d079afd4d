//! Service node core
//!
//! Masternode and systemnode lists kept in sync over gossip, the payment
//! queue built on them, the stake kernel search of an operated node and the
//! difficulty rules its blocks are checked against.

pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod driver;
pub mod node;
pub mod p2p;
pub mod rpc;
pub mod staking;
pub mod storage;
pub mod time;

/// Protocol constants
pub mod constants {
    /// Protocol version announced by this implementation
    pub const PROTOCOL_VERSION: u32 = 70210;

    /// Oldest protocol version still eligible for payments
    pub const MIN_PAYMENTS_PROTOCOL: u32 = 70208;
}
