//! Node kind parameterisation

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::consensus::ConsensusParams;

/// The two service-node kinds. They differ only in collateral, payment
/// slot and wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Masternode,
    Systemnode,
}

impl NodeType {
    pub const ALL: [NodeType; 2] = [NodeType::Masternode, NodeType::Systemnode];

    pub fn name(&self) -> &'static str {
        match self {
            NodeType::Masternode => "masternode",
            NodeType::Systemnode => "systemnode",
        }
    }

    /// Domain-separation tag mixed into every signed payload
    pub fn tag(&self) -> u8 {
        match self {
            NodeType::Masternode => 1,
            NodeType::Systemnode => 2,
        }
    }

    /// Exact collateral amount in base units
    pub fn collateral(&self, params: &ConsensusParams) -> u64 {
        match self {
            NodeType::Masternode => params.masternode_collateral,
            NodeType::Systemnode => params.systemnode_collateral,
        }
    }

    /// Coinbase output index that pays this node kind
    pub fn payment_slot(&self) -> usize {
        match self {
            NodeType::Masternode => 1,
            NodeType::Systemnode => 2,
        }
    }

    pub fn announce_command(&self) -> &'static str {
        match self {
            NodeType::Masternode => "mnb",
            NodeType::Systemnode => "snb",
        }
    }

    pub fn ping_command(&self) -> &'static str {
        match self {
            NodeType::Masternode => "mnp",
            NodeType::Systemnode => "snp",
        }
    }

    pub fn list_command(&self) -> &'static str {
        match self {
            NodeType::Masternode => "dseg",
            NodeType::Systemnode => "sndseg",
        }
    }

    pub fn sync_status_command(&self) -> &'static str {
        match self {
            NodeType::Masternode => "ssc",
            NodeType::Systemnode => "snssc",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
