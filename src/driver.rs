//! Periodic maintenance loop
//!
//! Every tick refreshes node states. Every 60 ticks terminal nodes are
//! evicted. The local operator pings every [`PING_SECONDS`], and once
//! proof-of-stake is active each operated node searches for a kernel on a
//! blocking thread.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::consensus::{get_next_work_required, ConsensusParams};
use crate::node::{ActiveAction, ActiveNode, PING_SECONDS};
use crate::p2p::GossipHandler;
use crate::staking::{CoinStake, StakeChain, StakeMinter, StakeResult};

/// Ticks between two eviction passes
pub const REMOVE_EVERY_TICKS: u64 = 60;

/// A service node run by this process
pub struct OperatedNode {
    pub active: Arc<Mutex<ActiveNode>>,
    pub handler: Arc<GossipHandler>,
    pub minter: Option<Arc<StakeMinter>>,
}

pub struct Driver {
    params: Arc<ConsensusParams>,
    chain: Arc<dyn StakeChain>,
    handlers: Vec<Arc<GossipHandler>>,
    operated: Vec<OperatedNode>,
    stakes: mpsc::UnboundedSender<CoinStake>,
    tick_seconds: u64,
    stake_seconds: u64,
}

impl Driver {
    pub fn new(
        params: Arc<ConsensusParams>,
        chain: Arc<dyn StakeChain>,
        handlers: Vec<Arc<GossipHandler>>,
        operated: Vec<OperatedNode>,
        stakes: mpsc::UnboundedSender<CoinStake>,
    ) -> Self {
        Self {
            params,
            chain,
            handlers,
            operated,
            stakes,
            tick_seconds: 1,
            stake_seconds: crate::staking::STAKE_SEARCH_INTERVAL as u64,
        }
    }

    pub fn with_intervals(mut self, tick_seconds: u64, stake_seconds: u64) -> Self {
        self.tick_seconds = tick_seconds.max(1);
        self.stake_seconds = stake_seconds.max(1);
        self
    }

    fn every(&self, seconds: u64) -> u64 {
        (seconds / self.tick_seconds).max(1)
    }

    /// Synchronous part of tick number `tick`
    pub fn tick(&self, tick: u64) {
        for handler in &self.handlers {
            handler.registry().check();
            if tick % REMOVE_EVERY_TICKS == 0 {
                let removed = handler.registry().check_and_remove(false);
                if removed > 0 {
                    debug!("Evicted {} {} entries", removed, handler.node_type());
                }
            }
        }

        if tick % self.every(PING_SECONDS as u64) == 0 {
            self.manage_active();
        }
    }

    /// Announce or ping every operated node and relay the result
    pub fn manage_active(&self) {
        let tip_hash = match self.chain.tip() {
            Some(tip) => tip.hash,
            None => return,
        };

        for operated in &self.operated {
            let registry = operated.handler.registry();
            let action = operated.active.lock().manage_status(registry, tip_hash);
            match action {
                Ok(ActiveAction::Announce(broadcast)) => operated.handler.relay_broadcast(&broadcast),
                Ok(ActiveAction::Ping(ping)) => operated.handler.relay_ping(&ping),
                Ok(ActiveAction::Idle) => {}
                Err(e) => warn!("Cannot manage {}: {}", operated.handler.node_type(), e),
            }
        }
    }

    /// One kernel search per operated, enabled node. Verified kernels are
    /// handed to the block producer; returns how many were found.
    pub async fn stake_round(&self) -> usize {
        let tip = match self.chain.tip() {
            Some(tip) => tip,
            None => return 0,
        };
        let height = tip.height + 1;
        if height < self.params.pos_start_height {
            return 0;
        }

        let mut found = 0;
        for operated in &self.operated {
            let minter = match &operated.minter {
                Some(minter) => Arc::clone(minter),
                None => continue,
            };
            let registry = operated.handler.registry();
            let node = match operated.active.lock().resolve(registry) {
                Some(node) if node.is_enabled() => node,
                _ => continue,
            };

            let now = registry.now();
            let bits = get_next_work_required(self.chain.as_ref(), &tip, now, &self.params);
            let search = Arc::clone(&minter);
            let result = tokio::task::spawn_blocking(move || search.create_coin_stake(height, bits, now, &node)).await;

            match result {
                Ok(Ok(StakeResult::Found(stake))) => {
                    if !minter.verify_kernel(&stake, bits) {
                        warn!("Discarding kernel {} that fails verification", stake.kernel_hash);
                        continue;
                    }
                    info!("Stake kernel for height {}: {}", height, stake.kernel_hash);
                    found += 1;
                    let _ = self.stakes.send(stake);
                }
                Ok(Ok(StakeResult::NotFound)) | Ok(Ok(StakeResult::Interrupted)) => {}
                Ok(Err(e)) => warn!("Stake search failed: {}", e),
                Err(e) => warn!("Stake search task failed: {}", e),
            }
        }
        found
    }

    /// Interrupt running kernel searches
    pub fn stop_staking(&self) {
        for minter in self.operated.iter().filter_map(|operated| operated.minter.as_ref()) {
            minter.stop();
        }
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.tick_seconds));
        let stake_every = self.every(self.stake_seconds);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            self.tick(tick);
            if tick % stake_every == 0 {
                self.stake_round().await;
            }
            tick += 1;
        }

        self.stop_staking();
        info!("Maintenance loop stopped");
    }
}
