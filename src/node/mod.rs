//! Service nodes - masternodes and systemnodes
//!
//! Both kinds run the same registry, gossip validation and payment
//! selection; `NodeType` carries everything that differs between them.

mod active;
mod messages;
mod node_type;
mod payments;
mod registry;
mod servicenode;

pub use active::*;
pub use messages::*;
pub use node_type::*;
pub use payments::*;
pub use registry::*;
pub use servicenode::*;

use thiserror::Error;

/// Confirmations a collateral output needs before its node is admitted
pub const MIN_CONFIRMATIONS: u64 = 15;
/// Minimum spacing between two pings of the same node
pub const MIN_PING_SECONDS: i64 = 10 * 60;
/// Minimum age of a stored broadcast before a newer one replaces it
pub const MIN_BROADCAST_SECONDS: i64 = 5 * 60;
/// Interval at which the local node pings
pub const PING_SECONDS: i64 = 5 * 60;
pub const EXPIRATION_SECONDS: i64 = 65 * 60;
pub const REMOVAL_SECONDS: i64 = 75 * 60;
/// State is recomputed at most this often unless forced
pub const CHECK_SECONDS: i64 = 5;
/// Cooldown between two full-list requests to or from one peer
pub const DSEG_SECONDS: i64 = 3 * 60 * 60;
/// Pings must reference a block no older than this many blocks
pub const PING_MAX_BLOCK_AGE: u64 = 24;
/// Allowed clock drift of signed gossip
pub const MAX_SIG_TIME_DRIFT: i64 = 60 * 60;

/// Rejected gossip. Every variant carries a misbehaviour weight for the
/// sending peer; zero means the message is dropped without penalty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GossipError {
    #[error("Signature time {0} is too far in the future")]
    SignatureInFuture(i64),
    #[error("Ping signature time {0} is too old")]
    PingTooOld(i64),
    #[error("Invalid network address")]
    InvalidAddress,
    #[error("Address already used by another node")]
    AddressInUse,
    #[error("Protocol version {0} below the payment minimum")]
    ProtocolTooOld(u32),
    #[error("Invalid broadcast signature")]
    BadBroadcastSignature,
    #[error("Invalid ping signature")]
    BadPingSignature,
    #[error("Broadcast is not newer than the stored one")]
    StaleBroadcast,
    #[error("Ping is not newer than the stored one")]
    StalePing,
    #[error("Ping arrived too early")]
    PingTooEarly,
    #[error("Ping references unknown block {0}")]
    UnknownBlock(crate::crypto::Hash),
    #[error("Ping references a block too far behind the tip")]
    BlockTooOld,
    #[error("Node is not active")]
    NodeNotActive,
    #[error("Collateral output not found or spent")]
    CollateralUnavailable,
    #[error("Collateral output does not pay the announced key")]
    CollateralKeyMismatch,
    #[error("Collateral amount {0} does not match the required amount")]
    CollateralAmount(u64),
    #[error("Collateral has only {0} confirmations")]
    InsufficientConfirmations(u64),
    #[error("Broadcast signed before its collateral confirmed")]
    SignedBeforeConfirmation,
    #[error("Peer already requested the node list")]
    ListAlreadyRequested,
}

impl GossipError {
    /// Misbehaviour score reported against the sending peer
    pub fn dos_score(&self) -> u32 {
        match self {
            GossipError::SignatureInFuture(_) | GossipError::PingTooOld(_) => 1,
            GossipError::SignedBeforeConfirmation => 20,
            GossipError::BadPingSignature => 33,
            GossipError::ListAlreadyRequested => 34,
            GossipError::BadBroadcastSignature => 100,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_scores() {
        assert_eq!(GossipError::BadBroadcastSignature.dos_score(), 100);
        assert_eq!(GossipError::BadPingSignature.dos_score(), 33);
        assert_eq!(GossipError::ListAlreadyRequested.dos_score(), 34);
        assert_eq!(GossipError::SignedBeforeConfirmation.dos_score(), 20);
        assert_eq!(GossipError::SignatureInFuture(0).dos_score(), 1);
        assert_eq!(GossipError::StalePing.dos_score(), 0);
        assert_eq!(GossipError::AddressInUse.dos_score(), 0);
    }
}
