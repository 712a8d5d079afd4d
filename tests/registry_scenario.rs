//! Registry behaviour driven through the gossip handler

mod common;

use parking_lot::Mutex;
use std::sync::Arc;

use common::{Recorder, TestChain, START};
use snode_core::chain::ChainIndex;
use snode_core::constants::MIN_PAYMENTS_PROTOCOL;
use snode_core::node::{
    calculate_score, BroadcastOutcome, GossipError, NodeState, NodeType, EXPIRATION_SECONDS,
};
use snode_core::p2p::{GossipHandler, Message, PeerId, PeerManager};

fn handler(chain: &TestChain, node_type: NodeType) -> (Arc<GossipHandler>, Arc<Recorder>, Arc<Mutex<PeerManager>>) {
    let network = Arc::new(Recorder::default());
    let peers = Arc::new(Mutex::new(PeerManager::new()));
    let handler = Arc::new(GossipHandler::new(
        chain.registry(node_type),
        network.clone(),
        peers.clone(),
    ));
    (handler, network, peers)
}

fn peer() -> PeerId {
    PeerId::new(1, "8.8.8.8:18444".parse().unwrap())
}

#[test]
fn test_thirty_nodes_counted_and_ranked() {
    let chain = TestChain::new(60);
    let (handler, _, _) = handler(&chain, NodeType::Masternode);
    let operators: Vec<_> = (1..=30).map(|seed| chain.fund(NodeType::Masternode, seed)).collect();

    for op in &operators {
        handler
            .process_message(&peer(), Message::Announce(op.announce(&chain)))
            .unwrap();
    }
    let registry = handler.registry();
    assert_eq!(registry.len(), 30);
    assert_eq!(registry.count_enabled(MIN_PAYMENTS_PROTOCOL), 30);

    // A newer announcement from an older client drops below the floor
    chain.clock.advance(60);
    let downgraded = operators[7].broadcast(&chain, START - 1800, START - 60, MIN_PAYMENTS_PROTOCOL - 1);
    assert_eq!(
        registry.apply_broadcast(&downgraded),
        Ok(BroadcastOutcome::Updated { relay: true })
    );
    assert_eq!(registry.count_enabled(MIN_PAYMENTS_PROTOCOL), 29);

    let height = 50;
    let block_hash = chain.chain.block_hash(height).unwrap();
    let ranks = registry.get_ranks(height, MIN_PAYMENTS_PROTOCOL);
    assert_eq!(ranks.len(), 29);
    for (i, (rank, _)) in ranks.iter().enumerate() {
        assert_eq!(*rank, i + 1);
    }
    for pair in ranks.windows(2) {
        let first = calculate_score(&pair[0].1.collateral, &block_hash);
        let second = calculate_score(&pair[1].1.collateral, &block_hash);
        assert!(first > second);
    }
    assert!(ranks.iter().all(|(_, node)| node.collateral != operators[7].collateral));

    // Same inputs, same ranks
    let again: Vec<_> = registry
        .get_ranks(height, MIN_PAYMENTS_PROTOCOL)
        .into_iter()
        .map(|(rank, node)| (rank, node.collateral))
        .collect();
    let first: Vec<_> = ranks.into_iter().map(|(rank, node)| (rank, node.collateral)).collect();
    assert_eq!(first, again);

    let winner = registry.current_winner(height, MIN_PAYMENTS_PROTOCOL).unwrap();
    assert_eq!(registry.get_rank(&winner.collateral, height, MIN_PAYMENTS_PROTOCOL, true), Some(1));
}

#[test]
fn test_replayed_gossip_is_a_no_op() {
    let chain = TestChain::new(60);
    let (handler, network, peers) = handler(&chain, NodeType::Systemnode);
    let op = chain.fund(NodeType::Systemnode, 1);
    let broadcast = op.announce(&chain);

    handler
        .process_message(&peer(), Message::Announce(broadcast.clone()))
        .unwrap();
    let seen = handler.registry().seen_counts();
    let relayed = network.relayed.lock().len();
    assert_eq!(relayed, 1);

    handler
        .process_message(&peer(), Message::Announce(broadcast.clone()))
        .unwrap();
    handler
        .process_message(&peer(), Message::Ping(broadcast.last_ping.clone().unwrap()))
        .unwrap();

    assert_eq!(handler.registry().len(), 1);
    assert_eq!(handler.registry().seen_counts(), seen);
    assert_eq!(network.relayed.lock().len(), relayed);
    assert_eq!(peers.lock().misbehavior_score(&peer()), 0);
}

#[test]
fn test_stale_signature_times_rejected() {
    let chain = TestChain::new(60);
    let (handler, _, _) = handler(&chain, NodeType::Systemnode);
    let registry = handler.registry();
    let op = chain.fund(NodeType::Systemnode, 2);
    registry.apply_broadcast(&op.announce(&chain)).unwrap();
    let stored = registry.find_by_collateral(&op.collateral).unwrap();

    // Older announcement: stored state stays
    let older = op.broadcast(&chain, START - 7200, START - 60, snode_core::constants::PROTOCOL_VERSION);
    assert_eq!(registry.apply_broadcast(&older), Err(GossipError::StaleBroadcast));

    // Ping no newer than the stored one
    let old_ping = op.ping(&chain, START - 60);
    assert_eq!(registry.apply_ping(&old_ping), Err(GossipError::StalePing));

    let after = registry.find_by_collateral(&op.collateral).unwrap();
    assert_eq!(after.sig_time, stored.sig_time);
    assert_eq!(after.last_ping, stored.last_ping);
}

#[test]
fn test_check_and_remove_leaves_no_terminal_nodes() {
    let chain = TestChain::new(60);
    let registry = chain.registry(NodeType::Systemnode);
    let fresh = chain.fund(NodeType::Systemnode, 1);
    let spent = chain.fund(NodeType::Systemnode, 2);
    let silent = chain.fund(NodeType::Systemnode, 3);
    for op in [&fresh, &spent, &silent] {
        registry.apply_broadcast(&op.announce(&chain)).unwrap();
    }

    chain.chain.spend_coin(&spent.collateral);
    chain.clock.advance(10);
    registry.check();

    // Only `fresh` keeps pinging
    chain.clock.advance(EXPIRATION_SECONDS - 130);
    registry
        .apply_ping(&fresh.ping(&chain, START + EXPIRATION_SECONDS - 130))
        .unwrap();
    chain.clock.advance(240);

    registry.check_and_remove(false);
    let states: Vec<NodeState> = registry.nodes().iter().map(|node| node.state).collect();
    assert!(states.iter().all(|state| !matches!(state, NodeState::Remove | NodeState::VinSpent)));
    assert!(registry.find_by_collateral(&spent.collateral).is_none());
    assert_eq!(
        registry.find_by_collateral(&silent.collateral).map(|node| node.state),
        Some(NodeState::Expired)
    );

    registry.check_and_remove(true);
    assert_eq!(registry.len(), 1);
    assert!(registry.find_by_collateral(&fresh.collateral).is_some());
}

#[test]
fn test_bad_signature_bans_peer() {
    let chain = TestChain::new(60);
    let (handler, _, peers) = handler(&chain, NodeType::Masternode);
    let op = chain.fund(NodeType::Masternode, 5);
    let mut forged = op.announce(&chain);
    forged.protocol_version += 1;

    assert_eq!(
        handler.process_message(&peer(), Message::Announce(forged)),
        Err(GossipError::BadBroadcastSignature)
    );
    assert!(peers.lock().is_banned(&peer()));
    assert!(handler.registry().is_empty());
}

#[test]
fn test_systemnode_cannot_take_masternode_address() {
    let chain = TestChain::new(60);
    let masternodes = chain.registry(NodeType::Masternode);
    let systemnodes = chain.registry(NodeType::Systemnode);
    systemnodes.defer_addresses_to(masternodes.clone());

    let master = chain.fund(NodeType::Masternode, 1);
    masternodes.apply_broadcast(&master.announce(&chain)).unwrap();

    let mut system = chain.fund(NodeType::Systemnode, 2);
    system.addr = master.addr;
    assert_eq!(
        systemnodes.apply_broadcast(&system.announce(&chain)),
        Err(GossipError::AddressInUse)
    );
    assert!(systemnodes.is_empty());

    // Only systemnodes defer; a free address is still admitted
    system.addr = "10.0.0.3:18444".parse().unwrap();
    assert_eq!(
        systemnodes.apply_broadcast(&system.announce(&chain)),
        Ok(BroadcastOutcome::Added)
    );
    let mut other = chain.fund(NodeType::Masternode, 4);
    other.addr = system.addr;
    assert_eq!(
        masternodes.apply_broadcast(&other.announce(&chain)),
        Ok(BroadcastOutcome::Added)
    );
}
