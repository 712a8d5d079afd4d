//! Node configuration file
//!
//! A JSON document; every field may be omitted.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::chain::OutPoint;
use crate::consensus::Network;
use crate::crypto::{Hash, PrivateKey};
use crate::node::{ActiveNode, NodeType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    /// P2P listen address; defaults to the network's port on all interfaces
    pub listen_addr: Option<SocketAddr>,
    /// Peers dialled at startup
    pub connect: Vec<SocketAddr>,
    pub rpc_port: u16,
    pub data_dir: PathBuf,
    pub log_filter: String,
    /// Maintenance tick, in seconds
    pub tick_seconds: u64,
    /// Stake times tried per search round, in seconds
    pub stake_search_interval: i64,
    pub masternode: Option<OperatorConfig>,
    pub systemnode: Option<OperatorConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            listen_addr: None,
            connect: Vec::new(),
            rpc_port: 18332,
            data_dir: PathBuf::from("snode-data"),
            log_filter: "info".to_string(),
            tick_seconds: 1,
            stake_search_interval: 30,
            masternode: None,
            systemnode: None,
        }
    }
}

/// Service node operated by this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Hex secret of the operational key that signs pings
    pub operator_key: String,
    /// Hex secret of the collateral key; without it the node can only
    /// ping an announcement made elsewhere
    #[serde(default)]
    pub collateral_key: Option<String>,
    pub collateral_txid: String,
    pub collateral_index: u32,
    pub service_addr: SocketAddr,
}

impl OperatorConfig {
    pub fn collateral(&self) -> Result<OutPoint, ConfigError> {
        let txid = Hash::from_hex(&self.collateral_txid)
            .map_err(|_| ConfigError::Invalid(format!("bad collateral txid {}", self.collateral_txid)))?;
        Ok(OutPoint::new(txid, self.collateral_index))
    }

    pub fn active_node(&self, node_type: NodeType) -> Result<ActiveNode, ConfigError> {
        let operator_key = parse_key(&self.operator_key, "operator")?;
        let collateral_key = self
            .collateral_key
            .as_deref()
            .map(|secret| parse_key(secret, "collateral"))
            .transpose()?;
        Ok(ActiveNode::new(
            node_type,
            self.collateral()?,
            self.service_addr,
            operator_key,
            collateral_key,
        ))
    }
}

fn parse_key(secret: &str, which: &str) -> Result<PrivateKey, ConfigError> {
    PrivateKey::from_hex(secret).map_err(|e| ConfigError::Invalid(format!("bad {} key: {}", which, e)))
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_seconds == 0 {
            return Err(ConfigError::Invalid("tick_seconds must be positive".into()));
        }
        if self.stake_search_interval <= 0 {
            return Err(ConfigError::Invalid("stake_search_interval must be positive".into()));
        }
        for (node_type, operator) in self.operators() {
            operator.active_node(node_type)?;
        }
        Ok(())
    }

    /// Configured operators with their node kind
    pub fn operators(&self) -> Vec<(NodeType, &OperatorConfig)> {
        [
            (NodeType::Masternode, self.masternode.as_ref()),
            (NodeType::Systemnode, self.systemnode.as_ref()),
        ]
        .into_iter()
        .filter_map(|(node_type, operator)| operator.map(|operator| (node_type, operator)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> OperatorConfig {
        OperatorConfig {
            operator_key: hex::encode(PrivateKey::generate().to_bytes()),
            collateral_key: None,
            collateral_txid: Hash::zero().to_hex(),
            collateral_index: 1,
            service_addr: "127.0.0.1:18444".parse().unwrap(),
        }
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_by_name() {
        let config: NodeConfig = serde_json::from_str(r#"{"network": "test", "rpc_port": 1}"#).unwrap();
        assert_eq!(config.network, Network::Test);
        assert_eq!(config.rpc_port, 1);
        assert_eq!(config.tick_seconds, 1);
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let config = NodeConfig {
            tick_seconds: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = NodeConfig {
            stake_search_interval: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_operator_section() {
        let mut config = NodeConfig {
            systemnode: Some(operator()),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_ok());
        let operators = config.operators();
        assert_eq!(operators.len(), 1);
        assert_eq!(operators[0].0, NodeType::Systemnode);

        let active = operators[0].1.active_node(NodeType::Systemnode).unwrap();
        assert_eq!(active.collateral(), OutPoint::new(Hash::zero(), 1));

        config.systemnode.as_mut().unwrap().operator_key = "zz".into();
        assert!(config.validate().is_err());
    }
}
