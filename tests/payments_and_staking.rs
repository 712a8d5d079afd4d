//! Payment queue rotation and stake pointer reuse across restarts

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{TestChain, BITS, START};
use snode_core::chain::{ChainIndex, PaymentHistory, TxOut};
use snode_core::consensus::COIN;
use snode_core::crypto::hash_bytes;
use snode_core::node::{NodeType, PaymentScheduler};
use snode_core::staking::{StakeMinter, StakeResult, UsedPointers};
use snode_core::storage::NodeCache;
use snode_core::time::Clock;

const EASY_BITS: u32 = 0x2100ffff;

fn miner() -> TxOut {
    TxOut {
        amount: 50 * COIN,
        pubkey_hash: hash_bytes(b"miner"),
    }
}

#[test]
fn test_every_node_paid_once_per_rotation() {
    let chain = TestChain::new(150);
    let registry = chain.registry(NodeType::Masternode);
    let operators: Vec<_> = (1..=12).map(|seed| chain.fund(NodeType::Masternode, seed)).collect();
    for op in &operators {
        registry.apply_broadcast(&op.announce(&chain)).unwrap();
    }
    let scheduler = PaymentScheduler::new(registry.clone(), chain.chain.clone());

    let mut paid = HashSet::new();
    for _ in 0..operators.len() {
        let height = chain.chain.height() + 1;
        let selection = scheduler.next_in_queue(height, true);
        assert_eq!(selection.eligible, operators.len());
        let payee = selection.payee.unwrap();
        assert!(paid.insert(payee.collateral), "{} paid twice", payee.collateral);

        let reward = TxOut {
            amount: 10 * COIN,
            pubkey_hash: payee.pubkey_collateral.pubkey_hash(),
        };
        chain
            .chain
            .append_block(chain.clock.now(), BITS, vec![miner(), reward], vec![])
            .unwrap();
        chain.clock.advance(60);
    }
    assert_eq!(paid.len(), operators.len());

    // The first node paid is due again
    let height = chain.chain.height() + 1;
    let first = chain.chain.at_height(151).unwrap();
    let next = scheduler.next_payee(height).unwrap();
    let node = registry.find_by_collateral(&next).unwrap();
    assert_eq!(
        chain
            .chain
            .recent_payment_blocks(&node.pubkey_collateral.pubkey_hash(), 1, 20)
            .last()
            .map(|block| block.hash),
        Some(first.hash)
    );
}

#[test]
fn test_scheduled_payee_skipped() {
    let chain = TestChain::new(150);
    let registry = chain.registry(NodeType::Systemnode);
    for seed in 1..=5 {
        let op = chain.fund(NodeType::Systemnode, seed);
        registry.apply_broadcast(&op.announce(&chain)).unwrap();
    }
    let scheduler = PaymentScheduler::new(registry.clone(), chain.chain.clone());

    let height = 151;
    let due = scheduler.next_payee(height).unwrap();
    let due_node = registry.find_by_collateral(&due).unwrap();
    chain
        .chain
        .schedule_payee(due_node.pubkey_collateral.pubkey_hash(), height);

    let selection = scheduler.next_in_queue(height, true);
    assert_eq!(selection.eligible, 4);
    assert_ne!(selection.payee.map(|node| node.collateral), Some(due));
}

#[test]
fn test_no_payee_before_score_height() {
    let chain = TestChain::new(50);
    let registry = chain.registry(NodeType::Masternode);
    let op = chain.fund(NodeType::Masternode, 1);
    registry.apply_broadcast(&op.announce(&chain)).unwrap();

    let scheduler = PaymentScheduler::new(registry, chain.chain.clone());
    assert_eq!(scheduler.next_payee(51), None);
}

#[test]
fn test_stake_pointer_not_reused_after_restart() {
    // Masternode paid at height 120, chain extended well past the reorg margin
    let chain = TestChain::new(119);
    let op = chain.fund(NodeType::Masternode, 9);
    let reward = TxOut {
        amount: 10 * COIN,
        pubkey_hash: op.owner.public_key().pubkey_hash(),
    };
    chain
        .chain
        .append_block(START - 200_000 + 120 * 60, BITS, vec![miner(), reward], vec![])
        .unwrap();
    for height in 121..=250i64 {
        chain
            .chain
            .append_block(START - 200_000 + height * 60, BITS, vec![miner()], vec![])
            .unwrap();
    }

    let registry = chain.registry(NodeType::Masternode);
    registry.apply_broadcast(&op.announce(&chain)).unwrap();
    let node = registry.find_by_collateral(&op.collateral).unwrap();

    let used = Arc::new(UsedPointers::new());
    let minter = StakeMinter::new(NodeType::Masternode, chain.params.clone(), chain.chain.clone(), used.clone());
    let stake = match minter.create_coin_stake(251, EASY_BITS, START, &node).unwrap() {
        StakeResult::Found(stake) => stake,
        other => panic!("expected a kernel, got {:?}", other),
    };
    assert_eq!(Some(stake.pointer.block_hash), chain.chain.block_hash(120));
    assert!(minter.verify_kernel(&stake, EASY_BITS));

    let cache = NodeCache::temporary().unwrap();
    cache.dump_used_pointers(&used).unwrap();

    // A fresh process restores the used set and finds nothing left to stake
    let restored = Arc::new(UsedPointers::new());
    assert_eq!(cache.load_used_pointers(&restored).unwrap(), 1);
    let restarted = StakeMinter::new(NodeType::Masternode, chain.params.clone(), chain.chain.clone(), restored);
    assert!(restarted.recent_stake_pointers(&node).unwrap().is_empty());
    assert!(matches!(
        restarted.create_coin_stake(251, EASY_BITS, START + 60, &node).unwrap(),
        StakeResult::NotFound
    ));
}
