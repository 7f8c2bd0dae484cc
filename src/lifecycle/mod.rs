//! Root bundle lifecycle control
//!
//! Drives a bundle through propose, dispute window and per-leaf execution
//! against the hub contract. The controller holds no state of its own: the
//! pending bundle, last executed ranges and hub time are re-read from the
//! hub every pass, so a dispute simply reverts the world to NoPendingBundle
//! and the next pass re-derives a fresh proposal from the same starting
//! ranges. Proposing posts a bond on the hub, forfeit if the proposal is
//! successfully disputed.

pub mod hub;

pub use hub::RpcHubPool;

use crate::balance::BalanceAllocator;
use crate::bundle::leaves::{BundleRoots, PoolRebalanceLeaf, RelayerRefundLeaf};
use crate::bundle::BundleBlockRange;
use crate::error::{DataworkerError, DataworkerResult};
use crate::merkle;

use async_trait::async_trait;
use ethers::types::{H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// On-chain view of the currently pending root bundle
#[derive(Debug, Clone)]
pub struct PendingBundle {
    pub pool_rebalance_root: [u8; 32],
    pub relayer_refund_root: [u8; 32],
    pub slow_relay_root: [u8; 32],
    pub proposal_block: u64,
    /// Hub timestamp after which rebalance leaves become executable
    pub challenge_period_end: u64,
    pub unclaimed_pool_rebalance_leaf_count: u32,
    pub block_ranges: Vec<BundleBlockRange>,
}

/// Lifecycle position of the hub, derived fresh each pass
#[derive(Debug, Clone)]
pub enum BundleStatus {
    NoPendingBundle,
    /// Pending and still inside the dispute window
    Proposed(PendingBundle),
    /// Dispute window passed; rebalance leaves are executable
    LivenessPassed(PendingBundle),
}

/// Outcome of validating a pending bundle against locally re-derived roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingVerdict {
    Valid,
    Disputed { tx: H256 },
}

/// Per-pass leaf execution accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutionSummary {
    pub executed: u32,
    pub skipped: u32,
}

/// Abstracted hub contract write boundary. Transaction signing and broadcast
/// live behind the implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubPool: Send + Sync {
    async fn pending_bundle(&self) -> DataworkerResult<Option<PendingBundle>>;

    /// End block of the last fully executed bundle, per chain
    async fn last_executed_end_blocks(&self) -> DataworkerResult<HashMap<u64, u64>>;

    /// Hub contract clock, seconds
    async fn current_time(&self) -> DataworkerResult<u64>;

    async fn propose(
        &self,
        pool_rebalance_root: [u8; 32],
        relayer_refund_root: [u8; 32],
        slow_relay_root: [u8; 32],
        block_ranges: Vec<BundleBlockRange>,
    ) -> DataworkerResult<H256>;

    async fn dispute_bundle(&self) -> DataworkerResult<H256>;

    async fn execute_pool_rebalance_leaf(
        &self,
        leaf: PoolRebalanceLeaf,
        proof: Vec<[u8; 32]>,
    ) -> DataworkerResult<H256>;

    async fn execute_relayer_refund_leaf(
        &self,
        leaf: RelayerRefundLeaf,
        proof: Vec<[u8; 32]>,
    ) -> DataworkerResult<H256>;
}

/// Derive the next bundle's block ranges: each chain starts one past the last
/// fully executed end and runs to its latest confirmed block. A chain whose
/// head is unavailable gets an empty range rather than failing the pass.
pub fn derive_ranges(
    chain_ids: &[u64],
    last_ends: &HashMap<u64, u64>,
    heads: &HashMap<u64, u64>,
) -> Vec<BundleBlockRange> {
    chain_ids
        .iter()
        .map(|chain_id| {
            let start_block = last_ends.get(chain_id).map(|e| e + 1).unwrap_or(0);
            let end_block = heads
                .get(chain_id)
                .copied()
                .unwrap_or(start_block.saturating_sub(1));
            BundleBlockRange {
                chain_id: *chain_id,
                start_block,
                end_block,
            }
        })
        .collect()
}

pub struct LifecycleController {
    hub: Arc<dyn HubPool>,
    hub_chain_id: u64,
}

impl LifecycleController {
    pub fn new(hub: Arc<dyn HubPool>, hub_chain_id: u64) -> Self {
        Self { hub, hub_chain_id }
    }

    /// Current lifecycle position, judged against the hub clock
    pub async fn status(&self) -> DataworkerResult<BundleStatus> {
        let pending = match self.hub.pending_bundle().await? {
            Some(pending) => pending,
            None => return Ok(BundleStatus::NoPendingBundle),
        };
        let now = self.hub.current_time().await?;
        if now >= pending.challenge_period_end {
            Ok(BundleStatus::LivenessPassed(pending))
        } else {
            Ok(BundleStatus::Proposed(pending))
        }
    }

    /// Propose a new bundle. Requires NoPendingBundle and ranges strictly
    /// advancing from the last fully executed bundle on every chain.
    pub async fn propose(
        &self,
        roots: &BundleRoots,
        block_ranges: Vec<BundleBlockRange>,
    ) -> DataworkerResult<H256> {
        if self.hub.pending_bundle().await?.is_some() {
            return Err(DataworkerError::Lifecycle(
                "A bundle is already pending; only one may be proposed at a time".into(),
            ));
        }

        let last_ends = self.hub.last_executed_end_blocks().await?;
        for range in &block_ranges {
            let expected_start = last_ends.get(&range.chain_id).map(|e| e + 1).unwrap_or(0);
            if range.start_block != expected_start {
                return Err(DataworkerError::Lifecycle(format!(
                    "Chain {} range starts at {} but the last executed bundle ended at {}",
                    range.chain_id,
                    range.start_block,
                    expected_start.saturating_sub(1),
                )));
            }
        }

        let tx = self
            .hub
            .propose(
                roots.pool_rebalance.root,
                roots.relayer_refund.root,
                roots.slow_relay.root,
                block_ranges,
            )
            .await?;
        info!(tx = ?tx, leaves = roots.pool_rebalance.leaves.len(), "Proposed root bundle");
        Ok(tx)
    }

    /// Validate a pending bundle against roots re-derived from its own block
    /// ranges; dispute on any mismatch. Our own proposals always match, so a
    /// dispute here targets a bad foreign proposal.
    pub async fn check_pending(
        &self,
        pending: &PendingBundle,
        computed: &BundleRoots,
    ) -> DataworkerResult<PendingVerdict> {
        let mismatch = pending.pool_rebalance_root != computed.pool_rebalance.root
            || pending.relayer_refund_root != computed.relayer_refund.root
            || pending.slow_relay_root != computed.slow_relay.root;

        if !mismatch {
            return Ok(PendingVerdict::Valid);
        }

        warn!(
            pending_pool_root = %hex::encode(pending.pool_rebalance_root),
            computed_pool_root = %hex::encode(computed.pool_rebalance.root),
            "Pending bundle does not match re-derived roots; disputing"
        );
        let tx = self.hub.dispute_bundle().await?;
        Ok(PendingVerdict::Disputed { tx })
    }

    /// Execute pool rebalance leaves after liveness has passed. Each leaf is
    /// independently proof-checked and balance-gated; a failed leaf is
    /// skipped and retried next pass without blocking the others.
    pub async fn execute_pool_rebalance_leaves(
        &self,
        pending: &PendingBundle,
        roots: &BundleRoots,
        allocator: &mut BalanceAllocator,
    ) -> DataworkerResult<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();

        for (i, leaf) in roots.pool_rebalance.leaves.iter().enumerate() {
            let proof = &roots.pool_rebalance.proofs[i];
            if !merkle::verify_proof(&pending.pool_rebalance_root, &leaf.hash(), proof) {
                // The hub only accepts an exact root match; a proof failure
                // here means our reconstruction diverged from the proposal
                return Err(DataworkerError::RootMismatch {
                    root_kind: "pool rebalance".into(),
                    computed: hex::encode(merkle::process_proof(proof, &leaf.hash())),
                    expected: hex::encode(pending.pool_rebalance_root),
                });
            }

            if !self.allocate_for_rebalance(leaf, allocator) {
                summary.skipped += 1;
                continue;
            }

            match self
                .hub
                .execute_pool_rebalance_leaf(leaf.clone(), proof.clone())
                .await
            {
                Ok(tx) => {
                    summary.executed += 1;
                    debug!(leaf_id = leaf.leaf_id, chain_id = leaf.chain_id, tx = ?tx,
                        "Executed pool rebalance leaf");
                    // Positive net sends will arrive on the spoke; let later
                    // refund executions count on them
                    for (token, amount) in leaf.l1_tokens.iter().zip(&leaf.net_send_amounts) {
                        if amount.is_positive() {
                            allocator.add_credit(leaf.chain_id, *token, amount.unsigned_abs());
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(leaf_id = leaf.leaf_id, error = %e,
                        "Pool rebalance leaf execution failed; will retry next pass");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Execute relayer refund leaves. Permissionless once the refund root is
    /// recorded on the spoke; only balance availability gates them here.
    pub async fn execute_relayer_refund_leaves(
        &self,
        roots: &BundleRoots,
        allocator: &mut BalanceAllocator,
    ) -> DataworkerResult<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();

        for (i, leaf) in roots.relayer_refund.leaves.iter().enumerate() {
            let proof = &roots.relayer_refund.proofs[i];

            let needed = leaf
                .refund_amounts
                .iter()
                .fold(leaf.amount_to_return, |acc, v| acc.saturating_add(*v));
            if !allocator.request_balance_allocation(leaf.chain_id, leaf.l1_token, needed) {
                debug!(
                    leaf_id = leaf.leaf_id,
                    chain_id = leaf.chain_id,
                    needed = %needed,
                    "Insufficient spoke balance for refund leaf; deferring"
                );
                summary.skipped += 1;
                continue;
            }

            match self
                .hub
                .execute_relayer_refund_leaf(leaf.clone(), proof.clone())
                .await
            {
                Ok(tx) => {
                    summary.executed += 1;
                    debug!(leaf_id = leaf.leaf_id, chain_id = leaf.chain_id, tx = ?tx,
                        "Executed relayer refund leaf");
                }
                Err(e) if e.is_retryable() => {
                    warn!(leaf_id = leaf.leaf_id, error = %e,
                        "Refund leaf execution failed; will retry next pass");
                    // The refund was not paid; restore the simulated balance
                    allocator.add_credit(leaf.chain_id, leaf.l1_token, needed);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Debit the hub-side balance for a leaf's positive net sends. All-or-
    /// nothing: a leaf is never partially funded.
    fn allocate_for_rebalance(
        &self,
        leaf: &PoolRebalanceLeaf,
        allocator: &mut BalanceAllocator,
    ) -> bool {
        let sends: Vec<_> = leaf
            .l1_tokens
            .iter()
            .zip(&leaf.net_send_amounts)
            .filter(|(_, amount)| amount.is_positive())
            .map(|(token, amount)| (*token, amount.unsigned_abs()))
            .collect();

        let mut taken: Vec<(ethers::types::Address, U256)> = Vec::new();
        for (token, amount) in &sends {
            if allocator.request_balance_allocation(self.hub_chain_id, *token, *amount) {
                taken.push((*token, *amount));
            } else {
                debug!(
                    leaf_id = leaf.leaf_id,
                    chain_id = leaf.chain_id,
                    token = ?token,
                    needed = %amount,
                    "Insufficient hub balance for rebalance leaf; deferring"
                );
                for (token, amount) in taken {
                    allocator.add_credit(self.hub_chain_id, token, amount);
                }
                return false;
            }
        }
        true
    }
}
