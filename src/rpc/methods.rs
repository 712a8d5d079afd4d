//! RPC Method Implementations
//!
//! Read-only queries over the service-node registries, the payment queue
//! and the difficulty schedule.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::chain::{ChainIndex, OutPoint};
use crate::consensus::{get_next_work_required, ConsensusParams};
use crate::crypto::Hash;
use crate::node::{ActiveNode, NodeType, PaymentScheduler, Registry, ServiceNode};
use crate::p2p::PeerManager;
use crate::time::Clock;

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Value,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;
const NOT_FOUND: i32 = -5;
const OUT_OF_RANGE: i32 = -8;

/// RPC Handler State
pub struct RpcState {
    pub params: Arc<ConsensusParams>,
    pub chain: Arc<dyn ChainIndex>,
    pub clock: Arc<dyn Clock>,
    /// One scheduler per node kind; each owns its registry
    pub schedulers: Vec<Arc<PaymentScheduler>>,
    pub peer_manager: Arc<Mutex<PeerManager>>,
    pub active_nodes: Vec<Arc<Mutex<ActiveNode>>>,
}

impl RpcState {
    fn scheduler(&self, node_type: NodeType) -> Option<&Arc<PaymentScheduler>> {
        self.schedulers
            .iter()
            .find(|scheduler| scheduler.registry().node_type() == node_type)
    }

    fn registry(&self, node_type: NodeType) -> Option<&Arc<Registry>> {
        self.scheduler(node_type).map(|scheduler| scheduler.registry())
    }
}

/// Process a JSON-RPC request and return a response
pub fn handle_request(state: &RpcState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id;
    let params = request.params;
    let result = match request.method.as_str() {
        "getinfo" => Ok(get_info(state)),
        "getnodecount" => get_node_count(state, &params),
        "listnodes" => list_nodes(state, &params),
        "getnoderank" => get_node_rank(state, &params),
        "getnoderanks" => get_node_ranks(state, &params),
        "getnextpayee" => get_next_payee(state, &params),
        "getnextworkrequired" => get_next_work(state),
        _ => Err((METHOD_NOT_FOUND, format!("Method not found: {}", request.method))),
    };

    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err((code, message)) => JsonRpcResponse::error(id, code, message),
    }
}

type RpcResult = Result<Value, (i32, String)>;

fn param(params: &Option<Value>, position: usize) -> Option<&Value> {
    match params {
        Some(Value::Array(items)) => items.get(position),
        Some(value) if position == 0 => Some(value),
        _ => None,
    }
}

fn node_type_param(params: &Option<Value>) -> Result<NodeType, (i32, String)> {
    let name = param(params, 0).and_then(Value::as_str).unwrap_or("masternode");
    NodeType::ALL
        .into_iter()
        .find(|node_type| node_type.name() == name)
        .ok_or_else(|| (INVALID_PARAMS, format!("Unknown node type: {}", name)))
}

fn height_param(state: &RpcState, params: &Option<Value>, position: usize) -> Result<u64, (i32, String)> {
    match param(params, position) {
        None | Some(Value::Null) => Ok(state.chain.height()),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| (INVALID_PARAMS, "Invalid params: expected height".to_string())),
    }
}

/// Collateral as `txid-index` or `txid:index`
pub fn parse_outpoint(text: &str) -> Option<OutPoint> {
    let (txid, index) = text.rsplit_once(|c| c == '-' || c == ':')?;
    Some(OutPoint::new(Hash::from_hex(txid).ok()?, index.parse().ok()?))
}

/// Full `txid-index` form, accepted back by `parse_outpoint`
pub fn format_outpoint(outpoint: &OutPoint) -> String {
    format!("{}-{}", outpoint.txid.to_hex(), outpoint.index)
}

fn registry_for(state: &RpcState, node_type: NodeType) -> Result<&Arc<Registry>, (i32, String)> {
    state
        .registry(node_type)
        .ok_or_else(|| (NOT_FOUND, format!("No {} registry", node_type)))
}

fn node_json(node: &ServiceNode) -> Value {
    json!({
        "collateral": format_outpoint(&node.collateral),
        "addr": node.addr.to_string(),
        "status": node.state.to_string(),
        "protocol": node.protocol_version,
        "payee": node.pubkey_collateral.to_address(),
        "sigtime": node.sig_time,
        "lastseen": node.last_ping.as_ref().map(|ping| ping.sig_time).unwrap_or(node.sig_time),
    })
}

/// Returns general node information
fn get_info(state: &RpcState) -> Value {
    let tip = state.chain.tip();
    let counts: serde_json::Map<String, Value> = state
        .schedulers
        .iter()
        .map(|scheduler| {
            let registry = scheduler.registry();
            (
                registry.node_type().name().to_string(),
                json!(registry.count_enabled(state.params.min_payments_protocol)),
            )
        })
        .collect();
    let active: Vec<Value> = state
        .active_nodes
        .iter()
        .map(|active| {
            let active = active.lock();
            json!({
                "type": active.node_type().name(),
                "collateral": format_outpoint(&active.collateral()),
                "status": active.status().to_string(),
            })
        })
        .collect();

    json!({
        "network": state.params.network.to_string(),
        "protocolversion": crate::constants::PROTOCOL_VERSION,
        "blocks": tip.as_ref().map(|tip| tip.height).unwrap_or(0),
        "bestblockhash": tip.map(|tip| tip.hash.to_string()),
        "connections": state.peer_manager.lock().connected_count(),
        "enabled": counts,
        "active": active,
    })
}

fn get_node_count(state: &RpcState, params: &Option<Value>) -> RpcResult {
    let registry = registry_for(state, node_type_param(params)?)?;
    Ok(json!({
        "total": registry.len(),
        "enabled": registry.enabled_nodes().len(),
        "payable": registry.count_enabled(state.params.min_payments_protocol),
    }))
}

fn list_nodes(state: &RpcState, params: &Option<Value>) -> RpcResult {
    let registry = registry_for(state, node_type_param(params)?)?;
    let mut nodes = registry.nodes();
    nodes.sort_by_key(|node| node.collateral);
    Ok(Value::Array(nodes.iter().map(node_json).collect()))
}

fn get_node_rank(state: &RpcState, params: &Option<Value>) -> RpcResult {
    let registry = registry_for(state, node_type_param(params)?)?;
    let collateral = param(params, 1)
        .and_then(Value::as_str)
        .and_then(parse_outpoint)
        .ok_or_else(|| (INVALID_PARAMS, "Invalid params: expected collateral".to_string()))?;
    let height = height_param(state, params, 2)?;

    registry
        .get_rank(&collateral, height, state.params.min_payments_protocol, true)
        .map(|rank| json!(rank))
        .ok_or_else(|| (NOT_FOUND, format!("No rank for {} at height {}", collateral, height)))
}

fn get_node_ranks(state: &RpcState, params: &Option<Value>) -> RpcResult {
    let registry = registry_for(state, node_type_param(params)?)?;
    let height = height_param(state, params, 1)?;
    if state.chain.block_hash(height).is_none() {
        return Err((OUT_OF_RANGE, format!("Block height {} out of range", height)));
    }

    let ranks = registry.get_ranks(height, state.params.min_payments_protocol);
    Ok(Value::Array(
        ranks
            .iter()
            .map(|(rank, node)| json!({ "rank": rank, "collateral": format_outpoint(&node.collateral) }))
            .collect(),
    ))
}

fn get_next_payee(state: &RpcState, params: &Option<Value>) -> RpcResult {
    let node_type = node_type_param(params)?;
    let scheduler = state
        .scheduler(node_type)
        .ok_or_else(|| (NOT_FOUND, format!("No {} registry", node_type)))?;
    let height = match param(params, 1) {
        None | Some(Value::Null) => state.chain.height() + 1,
        Some(_) => height_param(state, params, 1)?,
    };

    let selection = scheduler.next_in_queue(height, true);
    Ok(json!({
        "height": height,
        "eligible": selection.eligible,
        "payee": selection.payee.as_ref().map(node_json),
    }))
}

fn get_next_work(state: &RpcState) -> RpcResult {
    let tip = state
        .chain
        .tip()
        .ok_or_else(|| (OUT_OF_RANGE, "Chain is empty".to_string()))?;
    let bits = get_next_work_required(state.chain.as_ref(), &tip, state.clock.now(), &state.params);
    Ok(json!({
        "height": tip.height + 1,
        "bits": format!("{:08x}", bits),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MemoryChain, TxOut};
    use crate::consensus::COIN;
    use crate::crypto::{hash_bytes, PrivateKey};
    use crate::node::{Broadcast, NodePing};
    use crate::time::ManualClock;

    const START: i64 = 1_700_000_000;

    fn state_with_nodes(count: u32) -> (RpcState, Vec<OutPoint>) {
        let chain = Arc::new(MemoryChain::with_genesis(START - 10_000, 0x207fffff));
        for height in 1..=40i64 {
            chain
                .append_block(START - 10_000 + height * 60, 0x207fffff, vec![], vec![])
                .unwrap();
        }
        let params = Arc::new(ConsensusParams::regtest());
        let clock = Arc::new(ManualClock::new(START));
        let registry = Arc::new(Registry::new(
            NodeType::Masternode,
            params.clone(),
            chain.clone(),
            chain.clone(),
            clock.clone(),
        ));

        let mut collaterals = Vec::new();
        for i in 0..count {
            let owner = PrivateKey::generate();
            let collateral = OutPoint::new(hash_bytes(&i.to_le_bytes()), 0);
            chain.insert_coin(
                collateral,
                TxOut {
                    amount: 10_000 * COIN,
                    pubkey_hash: owner.public_key().pubkey_hash(),
                },
                1,
            );
            let operator = PrivateKey::generate();
            let ping = NodePing::new(
                NodeType::Masternode,
                collateral,
                chain.block_hash(35).unwrap(),
                START - 60,
                &operator,
            );
            let broadcast = Broadcast::new(
                NodeType::Masternode,
                collateral,
                format!("10.0.0.{}:18444", i + 1).parse().unwrap(),
                &owner,
                operator.public_key(),
                START - 3600,
                crate::constants::PROTOCOL_VERSION,
                Some(ping),
            );
            assert!(registry.add(crate::node::ServiceNode::from_broadcast(&broadcast)));
            collaterals.push(collateral);
        }

        let state = RpcState {
            params,
            chain: chain.clone(),
            clock,
            schedulers: vec![Arc::new(PaymentScheduler::new(registry, chain))],
            peer_manager: Arc::new(Mutex::new(PeerManager::new())),
            active_nodes: Vec::new(),
        };
        (state, collaterals)
    }

    fn call(state: &RpcState, method: &str, params: Value) -> JsonRpcResponse {
        handle_request(
            state,
            JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                method: method.to_string(),
                params: Some(params),
                id: json!(1),
            },
        )
    }

    #[test]
    fn test_unknown_method() {
        let (state, _) = state_with_nodes(0);
        let response = call(&state, "getbalance", json!([]));
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_node_count_and_list() {
        let (state, _) = state_with_nodes(3);
        let count = call(&state, "getnodecount", json!(["masternode"])).result.unwrap();
        assert_eq!(count["total"], json!(3));

        let list = call(&state, "listnodes", json!(["masternode"])).result.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 3);

        let missing = call(&state, "getnodecount", json!(["systemnode"]));
        assert_eq!(missing.error.unwrap().code, NOT_FOUND);
        let bogus = call(&state, "getnodecount", json!(["fullnode"]));
        assert_eq!(bogus.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn test_ranks_agree_with_rank_lookup() {
        let (state, collaterals) = state_with_nodes(4);
        let ranks = call(&state, "getnoderanks", json!(["masternode", 30])).result.unwrap();
        let ranks = ranks.as_array().unwrap();
        assert_eq!(ranks.len(), 4);

        for collateral in &collaterals {
            let rank = call(
                &state,
                "getnoderank",
                json!(["masternode", format_outpoint(collateral), 30]),
            )
            .result
            .unwrap();
            let listed = &ranks[rank.as_u64().unwrap() as usize - 1];
            assert_eq!(listed["collateral"], json!(format_outpoint(collateral)));
        }

        let far = call(&state, "getnoderanks", json!(["masternode", 1_000]));
        assert_eq!(far.error.unwrap().code, OUT_OF_RANGE);
    }

    #[test]
    fn test_next_work_required() {
        let (state, _) = state_with_nodes(0);
        let result = call(&state, "getnextworkrequired", json!([])).result.unwrap();
        assert_eq!(result["height"], json!(41));
        assert_eq!(result["bits"].as_str().unwrap().len(), 8);
    }

    #[test]
    fn test_parse_outpoint() {
        let txid = hash_bytes(b"tx");
        let outpoint = OutPoint::new(txid, 3);
        assert_eq!(parse_outpoint(&format_outpoint(&outpoint)), Some(outpoint));
        assert_eq!(
            parse_outpoint(&format!("{}:1", txid.to_hex())),
            Some(OutPoint::new(txid, 1))
        );
        assert_eq!(parse_outpoint("nonsense"), None);
    }
}
