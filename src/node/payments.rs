//! Payment queue: which service node the next block pays

use primitive_types::U256;
use std::sync::Arc;
use tracing::debug;

use super::{Registry, ServiceNode};
use crate::chain::{OutPoint, PaymentHistory};

/// Blocks between the scored block and the paid height
const SCORE_LOOKBACK: u64 = 100;
/// Sig-time cooldown per enabled node
const SIG_TIME_DELAY_PER_NODE: i64 = 60;

/// Outcome of a queue lookup
#[derive(Debug, Clone)]
pub struct PayeeSelection {
    pub payee: Option<ServiceNode>,
    /// Nodes that passed the eligibility filters
    pub eligible: usize,
}

pub struct PaymentScheduler {
    registry: Arc<Registry>,
    history: Arc<dyn PaymentHistory>,
}

impl PaymentScheduler {
    pub fn new(registry: Arc<Registry>, history: Arc<dyn PaymentHistory>) -> Self {
        Self { registry, history }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Select the node to pay at `height`.
    ///
    /// Eligible nodes are enabled, not already scheduled, old enough (both
    /// by announcement and by collateral confirmations). The tenth of the
    /// network that waited longest is scored at `height - 100` and the
    /// best score wins. At least one candidate is always scored.
    pub fn next_in_queue(&self, height: u64, filter_sig_time: bool) -> PayeeSelection {
        let node_type = self.registry.node_type();
        let slot = node_type.payment_slot();
        let min_protocol = self.registry.params().min_payments_protocol;
        let now = self.registry.now();

        let node_count = self.registry.count_enabled(min_protocol);
        let mut candidates: Vec<(i64, ServiceNode)> = Vec::new();

        for node in self.registry.enabled_nodes() {
            let payee = node.pubkey_collateral.pubkey_hash();
            if self.history.is_scheduled(&payee, height) {
                continue;
            }
            if filter_sig_time && node.sig_time + node_count as i64 * SIG_TIME_DELAY_PER_NODE > now {
                continue;
            }
            let age = self.registry.collateral_age(&node.collateral).unwrap_or(0);
            if age < node_count as u64 {
                continue;
            }

            let last_paid = self.history.last_paid_time(&payee, slot);
            candidates.push((node.seconds_since_payment(now, last_paid), node));
        }

        // Network restarting or upgrading: don't penalise fresh announcements
        if filter_sig_time && candidates.len() < node_count / 3 {
            return self.next_in_queue(height, false);
        }

        let eligible = candidates.len();
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.collateral.cmp(&b.1.collateral))
        });

        let score_height = match height.checked_sub(SCORE_LOOKBACK) {
            Some(h) => h,
            None => return PayeeSelection { payee: None, eligible },
        };

        let tenth = (self.registry.count_enabled(min_protocol) / 10).max(1);
        let mut best: Option<(U256, ServiceNode)> = None;
        for (_, node) in candidates.into_iter().take(tenth) {
            let score = match self.registry.calculate_score(&node.collateral, score_height) {
                Some(score) => score,
                None => break,
            };
            if best.as_ref().map_or(true, |(high, _)| score > *high) {
                best = Some((score, node));
            }
        }

        let payee = best.map(|(_, node)| node);
        if let Some(node) = &payee {
            debug!("{} payee at {}: {} of {} eligible", node_type, height, node.collateral, eligible);
        }
        PayeeSelection { payee, eligible }
    }

    /// Collateral of the node due at `height`, with the sig-time filter
    pub fn next_payee(&self, height: u64) -> Option<OutPoint> {
        self.next_in_queue(height, true)
            .payee
            .map(|node| node.collateral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainIndex, MemoryChain, TxOut};
    use crate::consensus::{ConsensusParams, COIN};
    use crate::crypto::{hash_bytes, PrivateKey};
    use crate::node::{Broadcast, NodePing, NodeType};
    use crate::time::ManualClock;

    const START: i64 = 1_700_000_000;

    struct Fixture {
        chain: Arc<MemoryChain>,
        registry: Arc<Registry>,
        owners: Vec<PrivateKey>,
    }

    fn payout(owner: Option<&PrivateKey>) -> Vec<TxOut> {
        let miner = TxOut {
            amount: 50 * COIN,
            pubkey_hash: hash_bytes(b"miner"),
        };
        let masternode = TxOut {
            amount: 10 * COIN,
            pubkey_hash: hash_bytes(b"masternode"),
        };
        match owner {
            Some(key) => vec![
                miner,
                masternode,
                TxOut {
                    amount: 5 * COIN,
                    pubkey_hash: key.public_key().pubkey_hash(),
                },
            ],
            None => vec![miner],
        }
    }

    /// Ten systemnodes; node i was last paid in block i + 1
    fn fixture(recent_sig_time: Option<usize>) -> Fixture {
        let chain = Arc::new(MemoryChain::with_genesis(START - 200_000, 0x207fffff));
        let owners: Vec<PrivateKey> = (0..10).map(|_| PrivateKey::generate()).collect();

        for height in 1..=150u64 {
            let owner = owners.get(height as usize - 1);
            chain
                .append_block(START - 200_000 + height as i64 * 60, 0x207fffff, payout(owner), vec![])
                .unwrap();
        }

        let clock = Arc::new(ManualClock::new(START));
        let registry = Arc::new(Registry::new(
            NodeType::Systemnode,
            Arc::new(ConsensusParams::regtest()),
            chain.clone(),
            chain.clone(),
            clock,
        ));

        let tip = chain.tip().unwrap().hash;
        for (i, owner) in owners.iter().enumerate() {
            let collateral = OutPoint::new(hash_bytes(&[i as u8, 0xcc]), 0);
            chain.insert_coin(
                collateral,
                TxOut {
                    amount: 500 * COIN,
                    pubkey_hash: owner.public_key().pubkey_hash(),
                },
                1,
            );
            let (sig_time, ping_time) = if recent_sig_time == Some(i) {
                (START - 300, START + 300)
            } else {
                (START - 3600, START - 60)
            };
            let operator = PrivateKey::generate();
            let ping = NodePing::new(NodeType::Systemnode, collateral, tip, ping_time, &operator);
            let broadcast = Broadcast::new(
                NodeType::Systemnode,
                collateral,
                format!("10.1.0.{}:18444", i + 1).parse().unwrap(),
                owner,
                operator.public_key(),
                sig_time,
                70210,
                Some(ping),
            );
            registry.apply_broadcast(&broadcast).unwrap();
        }

        Fixture {
            chain,
            registry,
            owners,
        }
    }

    fn collateral_of(fixture: &Fixture, i: usize) -> OutPoint {
        let pubkey = fixture.owners[i].public_key();
        fixture
            .registry
            .nodes()
            .into_iter()
            .find(|node| node.pubkey_collateral == pubkey)
            .unwrap()
            .collateral
    }

    #[test]
    fn test_longest_waiting_node_is_paid() {
        let fixture = fixture(None);
        let scheduler = PaymentScheduler::new(fixture.registry.clone(), fixture.chain.clone());

        let selection = scheduler.next_in_queue(151, true);
        assert_eq!(selection.eligible, 10);
        assert_eq!(selection.payee.map(|n| n.collateral), Some(collateral_of(&fixture, 0)));
    }

    #[test]
    fn test_scheduled_and_fresh_nodes_are_skipped() {
        let fixture = fixture(Some(1));
        fixture
            .chain
            .schedule_payee(fixture.owners[0].public_key().pubkey_hash(), 153);
        let scheduler = PaymentScheduler::new(fixture.registry.clone(), fixture.chain.clone());

        let selection = scheduler.next_in_queue(151, true);
        assert_eq!(selection.eligible, 8);
        assert_eq!(selection.payee.map(|n| n.collateral), Some(collateral_of(&fixture, 2)));
    }

    #[test]
    fn test_no_score_block_means_no_payee() {
        let fixture = fixture(None);
        let scheduler = PaymentScheduler::new(fixture.registry.clone(), fixture.chain.clone());
        assert!(scheduler.next_in_queue(50, true).payee.is_none());
    }
}
