//! Bundle construction: event reconciliation and Merkle leaf building

pub mod leaves;
pub mod reconciler;

pub use leaves::{BundleRoots, PoolRebalanceLeaf, RelayerRefundLeaf, SlowRelayLeaf};
pub use reconciler::{reconcile, SettlementLedger};

use serde::{Deserialize, Serialize};

/// Inclusive block range a bundle covers on one chain. Ranges never overlap
/// and never regress; the next bundle starts at the previous fully-executed
/// bundle's end + 1. A range with end < start contributes no events (used
/// when a chain was unavailable during the pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleBlockRange {
    pub chain_id: u64,
    pub start_block: u64,
    pub end_block: u64,
}

impl BundleBlockRange {
    pub fn contains(&self, block: u64) -> bool {
        block >= self.start_block && block <= self.end_block
    }

    pub fn is_empty(&self) -> bool {
        self.end_block < self.start_block
    }
}
