//! Service-node gossip messages
//!
//! Framing: 4-byte network magic, little-endian u32 payload length, bincode
//! payload. Wire command names follow the node kind (`mnb`/`snb`, ...).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::OutPoint;
use crate::crypto::Hash;
use crate::node::{Broadcast, NodePing, NodeType};

/// Maximum payload size (4 MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Sync-status stage reported after a full list was served
pub const SYNC_STAGE_LIST: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Message too short")]
    TooShort,
    #[error("Invalid network magic")]
    BadMagic,
    #[error("Message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("Incomplete message")]
    Incomplete,
    #[error("Deserialization error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Node announcement (`mnb`/`snb`)
    Announce(Broadcast),
    /// Node ping (`mnp`/`snp`)
    Ping(NodePing),
    /// List request (`dseg`/`sndseg`); `None` asks for every node
    ListRequest {
        node_type: NodeType,
        collateral: Option<OutPoint>,
    },
    /// Sent after the inventory answering a full list request
    SyncStatus {
        node_type: NodeType,
        stage: u32,
        count: u32,
    },
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InvType {
    MasternodeAnnounce,
    MasternodePing,
    MasternodeWinner,
    SystemnodeAnnounce,
    SystemnodePing,
    SystemnodeWinner,
}

impl InvType {
    pub fn announce(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Masternode => InvType::MasternodeAnnounce,
            NodeType::Systemnode => InvType::SystemnodeAnnounce,
        }
    }

    pub fn ping(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Masternode => InvType::MasternodePing,
            NodeType::Systemnode => InvType::SystemnodePing,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            InvType::MasternodeAnnounce | InvType::MasternodePing | InvType::MasternodeWinner => {
                NodeType::Masternode
            }
            _ => NodeType::Systemnode,
        }
    }
}

/// Inventory item (reference to an announcement, ping or winner vote)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvItem {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }
}

impl Message {
    /// Frame the message for the network identified by `magic`
    pub fn to_bytes(&self, magic: [u8; 4]) -> Vec<u8> {
        let payload = bincode::serialize(self).unwrap_or_default();

        let mut bytes = Vec::with_capacity(4 + 4 + payload.len());
        bytes.extend_from_slice(&magic);
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);

        bytes
    }

    pub fn from_bytes(bytes: &[u8], magic: [u8; 4]) -> Result<Self, FrameError> {
        if bytes.len() < 8 {
            return Err(FrameError::TooShort);
        }
        if bytes[0..4] != magic {
            return Err(FrameError::BadMagic);
        }

        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if bytes.len() < 8 + length {
            return Err(FrameError::Incomplete);
        }

        bincode::deserialize(&bytes[8..8 + length]).map_err(|e| FrameError::Decode(e.to_string()))
    }

    /// Node kind the message belongs to; `None` for generic inventory
    pub fn node_type(&self) -> Option<NodeType> {
        match self {
            Message::Announce(broadcast) => Some(broadcast.node_type),
            Message::Ping(ping) => Some(ping.node_type),
            Message::ListRequest { node_type, .. } | Message::SyncStatus { node_type, .. } => {
                Some(*node_type)
            }
            Message::Inv(_) | Message::GetData(_) => None,
        }
    }

    /// Wire command name
    pub fn command(&self) -> &'static str {
        match self {
            Message::Announce(broadcast) => broadcast.node_type.announce_command(),
            Message::Ping(ping) => ping.node_type.ping_command(),
            Message::ListRequest { node_type, .. } => node_type.list_command(),
            Message::SyncStatus { node_type, .. } => node_type.sync_status_command(),
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    const MAGIC: [u8; 4] = [0xb8, 0xeb, 0xb3, 0xdf];

    #[test]
    fn test_frame_roundtrip() {
        let msg = Message::ListRequest {
            node_type: NodeType::Systemnode,
            collateral: Some(OutPoint::new(hash_bytes(b"c"), 3)),
        };
        let bytes = msg.to_bytes(MAGIC);
        assert_eq!(&bytes[0..4], &MAGIC);
        assert_eq!(Message::from_bytes(&bytes, MAGIC), Ok(msg));
    }

    #[test]
    fn test_invalid_frames_rejected() {
        let mut bytes = Message::Inv(vec![]).to_bytes(MAGIC);
        assert_eq!(Message::from_bytes(&bytes, [0, 0, 0, 0]), Err(FrameError::BadMagic));
        assert_eq!(Message::from_bytes(&bytes[..5], MAGIC), Err(FrameError::TooShort));

        bytes.truncate(bytes.len() - 1);
        assert_eq!(Message::from_bytes(&bytes, MAGIC), Err(FrameError::Incomplete));
    }

    #[test]
    fn test_commands_follow_node_kind() {
        let dseg = Message::ListRequest {
            node_type: NodeType::Masternode,
            collateral: None,
        };
        assert_eq!(dseg.command(), "dseg");
        assert_eq!(dseg.node_type(), Some(NodeType::Masternode));

        let status = Message::SyncStatus {
            node_type: NodeType::Systemnode,
            stage: SYNC_STAGE_LIST,
            count: 4,
        };
        assert_eq!(status.command(), "snssc");
        assert_eq!(Message::GetData(vec![]).node_type(), None);
    }

    #[test]
    fn test_inv_type_kinds() {
        for node_type in NodeType::ALL {
            assert_eq!(InvType::announce(node_type).node_type(), node_type);
            assert_eq!(InvType::ping(node_type).node_type(), node_type);
        }
    }
}
