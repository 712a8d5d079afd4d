//! Service node daemon
//!
//! Keeps the masternode and systemnode lists in sync with peers, answers
//! RPC queries about them, and operates the configured nodes.

use clap::Parser;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use snode_core::chain::MemoryChain;
use snode_core::config::NodeConfig;
use snode_core::consensus::{encode_compact, ConsensusParams, Network};
use snode_core::driver::{Driver, OperatedNode};
use snode_core::node::{NodeType, PaymentScheduler, Registry};
use snode_core::p2p::{run_dispatcher, GossipHandler, GossipRouter, OutboundQueue, PeerHub, PeerManager, PeerNetwork, Transport};
use snode_core::rpc::{start_rpc_server, RpcState};
use snode_core::staking::{CoinStake, StakeMinter, UsedPointers};
use snode_core::storage::NodeCache;
use snode_core::time::{Clock, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "snode")]
#[command(about = "Service node list, payment queue and stake kernel daemon", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured network (main, test, regtest)
    #[arg(long)]
    network: Option<Network>,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = args.network {
        config.network = network;
    }
    config.validate()?;
    init_tracing(&config.log_filter);

    let params = Arc::new(ConsensusParams::for_network(config.network));
    info!("Starting snode on {}", params.network);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // Block storage belongs to the host node; run on a fresh in-memory chain
    let chain = Arc::new(MemoryChain::with_genesis(clock.now(), encode_compact(params.pow_limit)));

    std::fs::create_dir_all(&config.data_dir)?;
    let cache = NodeCache::open(config.data_dir.join("cache"))?;
    let used_pointers = Arc::new(UsedPointers::new());
    match cache.load_used_pointers(&used_pointers) {
        Ok(count) => info!("Loaded {} used stake pointers", count),
        Err(e) => warn!("Ignoring stake pointer cache: {}", e),
    }

    let peers = Arc::new(Mutex::new(PeerManager::new()));
    let (queue, outbound) = OutboundQueue::new();
    let network: Arc<dyn PeerNetwork> = Arc::new(queue);

    let mut handlers = Vec::new();
    let mut schedulers = Vec::new();
    for node_type in NodeType::ALL {
        let registry = Arc::new(Registry::new(
            node_type,
            params.clone(),
            chain.clone(),
            chain.clone(),
            clock.clone(),
        ));
        match cache.load_registry(&registry) {
            Ok(true) => {
                registry.check_and_remove(false);
            }
            Ok(false) => {}
            Err(e) => warn!("Ignoring {} cache: {}", node_type, e),
        }
        if node_type == NodeType::Systemnode {
            let masternodes = handlers
                .iter()
                .find(|handler: &&Arc<GossipHandler>| handler.node_type() == NodeType::Masternode);
            if let Some(masternodes) = masternodes {
                registry.defer_addresses_to(masternodes.registry().clone());
            }
        }
        handlers.push(Arc::new(GossipHandler::new(registry.clone(), network.clone(), peers.clone())));
        schedulers.push(Arc::new(PaymentScheduler::new(registry, chain.clone())));
    }

    let mut operated = Vec::new();
    let mut active_nodes = Vec::new();
    for (node_type, operator) in config.operators() {
        let handler = match handlers.iter().find(|handler| handler.node_type() == node_type) {
            Some(handler) => handler.clone(),
            None => continue,
        };
        let active = Arc::new(Mutex::new(operator.active_node(node_type)?));
        let minter = StakeMinter::new(node_type, params.clone(), chain.clone(), used_pointers.clone())
            .with_search_interval(config.stake_search_interval);
        info!("Operating {} {}", node_type, operator.collateral()?);

        active_nodes.push(active.clone());
        operated.push(OperatedNode {
            active,
            handler,
            minter: Some(Arc::new(minter)),
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hub = Arc::new(PeerHub::new());
    tokio::spawn(run_dispatcher(outbound, hub.clone()));
    let router = Arc::new(GossipRouter::new(handlers.clone()));
    let transport = Arc::new(Transport::new(params.magic, router, peers.clone(), hub));

    let listen_addr = config
        .listen_addr
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], params.default_port)));
    let listener = TcpListener::bind(listen_addr).await?;
    info!("P2P listening on {}", listen_addr);
    tokio::spawn(transport.clone().listen(listener, shutdown_rx.clone()));
    for addr in &config.connect {
        if let Err(e) = transport.clone().connect(*addr, shutdown_rx.clone()).await {
            warn!("Cannot connect to {}: {}", addr, e);
        }
    }

    // Block assembly is done by the host node; kernels are only reported
    let (stake_tx, mut stake_rx) = mpsc::unbounded_channel::<CoinStake>();
    tokio::spawn(async move {
        while let Some(stake) = stake_rx.recv().await {
            info!(
                "Kernel ready: pointer {} at time {} paying {}",
                stake.pointer.outpoint(),
                stake.stake_time,
                stake.payee
            );
        }
    });

    let driver = Arc::new(
        Driver::new(params.clone(), chain.clone(), handlers.clone(), operated, stake_tx)
            .with_intervals(config.tick_seconds, config.stake_search_interval as u64),
    );
    let driver_task = tokio::spawn(driver.clone().run(shutdown_rx.clone()));

    let rpc_state = Arc::new(RpcState {
        params,
        chain,
        clock,
        schedulers,
        peer_manager: peers,
        active_nodes,
    });
    let rpc_task = tokio::spawn(start_rpc_server(rpc_state, config.rpc_port, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping node");
    driver.stop_staking();
    let _ = shutdown_tx.send(true);
    let _ = driver_task.await;
    if let Ok(Err(e)) = rpc_task.await {
        warn!("RPC server error: {}", e);
    }

    for handler in &handlers {
        if let Err(e) = cache.dump_registry(handler.registry()) {
            warn!("Cannot write {} cache: {}", handler.node_type(), e);
        }
    }
    if let Err(e) = cache.dump_used_pointers(&used_pointers) {
        warn!("Cannot write stake pointer cache: {}", e);
    }

    Ok(())
}
