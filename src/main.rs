//! Lattice Dataworker - off-chain settlement engine for the Lattice bridge
//!
//! Reconstructs settlement state from on-chain events across all configured
//! chains, proposes and executes Merkle-committed root bundles against the
//! hub pool, and finalizes withdrawals returning over native bridges. Runs
//! exactly one pass per invocation; an external scheduler provides the
//! cadence, and at most one proposer instance should run at a time.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

mod balance;
mod bundle;
mod chain;
mod config;
mod engine;
mod error;
mod events;
mod finalizer;
mod lifecycle;
mod merkle;
mod metrics;

use chain::{ChainRegistry, RpcChainReader};
use config::{Settings, TokenMap};
use engine::SettlementEngine;
use finalizer::{BridgeConnector, Finalizer, RpcBridgeConnector, RpcCallAggregator};
use lifecycle::RpcHubPool;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Lattice Dataworker v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let tokens = TokenMap::from_configs(&settings.tokens)
        .context("Failed to build token map")?;

    // One reader and one bridge connector per enabled chain
    let registry = Arc::new(ChainRegistry::new());
    let mut connectors: HashMap<u64, Arc<dyn BridgeConnector>> = HashMap::new();
    for (name, chain) in settings.enabled_chains() {
        let reader = RpcChainReader::new(chain.clone(), settings.dataworker.read_timeout_secs)
            .with_context(|| format!("Failed to initialize reader for chain {}", name))?;
        registry.register(chain.chain_id, Arc::new(reader));

        if chain.chain_id != settings.dataworker.hub_chain_id {
            let connector =
                RpcBridgeConnector::new(chain.clone(), settings.dataworker.read_timeout_secs)
                    .with_context(|| format!("Failed to initialize bridge for chain {}", name))?;
            connectors.insert(chain.chain_id, Arc::new(connector));
        }
        info!("Chain {} (ID: {}) initialized", chain.name, chain.chain_id);
    }

    let hub_chain = settings
        .get_chain_by_id(settings.dataworker.hub_chain_id)
        .context("Hub chain missing from configuration")?;
    let hub = RpcHubPool::new(
        &hub_chain.rpc_url,
        &settings.dataworker.hub_pool_address,
        settings.dataworker.read_timeout_secs,
    )
    .context("Failed to initialize hub pool adapter")?;

    let aggregator = RpcCallAggregator::new(
        &hub_chain.rpc_url,
        &settings.dataworker.multicall_address,
    )
    .context("Failed to initialize call aggregator")?;

    let finalizer = Finalizer::new(
        Arc::new(aggregator),
        tokens.clone(),
        settings.dataworker.min_message_version,
    );

    let engine = SettlementEngine::new(
        settings,
        tokens,
        registry,
        Arc::new(hub),
        finalizer,
        connectors,
    );

    match engine.run_pass().await {
        Ok(report) => {
            let summary = serde_json::to_string(&report)
                .unwrap_or_else(|_| format!("{:?}", report));
            info!(report = %summary, "Dataworker pass finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal_for_pass(), "Dataworker pass failed");
            Err(e.into())
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lattice_dataworker=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}
