//! Chain access boundary
//!
//! The engine consumes chains through the `ChainReader` trait: a bounded
//! block-range scan returning the typed event set plus the last scanned
//! block. The default JSON-RPC implementation lives in `provider`; tests and
//! embedders substitute their own.

pub mod provider;

pub use provider::RpcChainReader;

use crate::error::{DataworkerError, DataworkerResult};
use crate::events::{Deposit, Fill, RouteUpdate, SlowFillRequest, TokensBridged};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Typed events extracted from one chain over one block range
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub chain_id: u64,
    pub deposits: Vec<Deposit>,
    pub fills: Vec<Fill>,
    pub slow_fill_requests: Vec<SlowFillRequest>,
    pub route_updates: Vec<RouteUpdate>,
    pub tokens_bridged: Vec<TokensBridged>,
    /// Last block actually scanned; the next range starts after it
    pub last_block: u64,
}

/// Per-chain log scanner producing the settlement event set
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Scan `[from_block, to_block]` and return all settlement events
    async fn read(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> DataworkerResult<EventBatch>;

    /// Highest block the reader considers scannable, already discounted by
    /// the chain's confirmation depth
    async fn latest_block(&self, chain_id: u64) -> DataworkerResult<u64>;

    /// ERC-20 balance of `holder`, used to seed the execution pass's
    /// simulated balance ledger
    async fn token_balance(
        &self,
        chain_id: u64,
        token: ethers::types::Address,
        holder: ethers::types::Address,
    ) -> DataworkerResult<ethers::types::U256>;
}

/// Registry of readers for all configured chains
#[derive(Default)]
pub struct ChainRegistry {
    readers: DashMap<u64, Arc<dyn ChainReader>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, chain_id: u64, reader: Arc<dyn ChainReader>) {
        self.readers.insert(chain_id, reader);
    }

    pub fn get(&self, chain_id: u64) -> DataworkerResult<Arc<dyn ChainReader>> {
        self.readers
            .get(&chain_id)
            .map(|r| r.clone())
            .ok_or(DataworkerError::ChainNotFound { chain_id })
    }

    /// All registered chain IDs in ascending order
    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.readers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}
