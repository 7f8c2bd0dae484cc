//! One settlement pass
//!
//! Orchestrates the full read-reconcile-commit cycle: concurrent chain
//! reads, ledger reconciliation, leaf construction, bundle lifecycle actions
//! and withdrawal finalization. Reads fan out across chains; every write is
//! sequential and derived from the single reconciled ledger, and nothing is
//! written if reconciliation or root reconstruction fails.

use crate::balance::BalanceAllocator;
use crate::bundle::leaves::{build_bundle, BundleRoots};
use crate::bundle::reconciler::reconcile;
use crate::bundle::BundleBlockRange;
use crate::chain::{ChainRegistry, EventBatch};
use crate::config::{Settings, TokenMap};
use crate::error::{DataworkerError, DataworkerResult};
use crate::events::{Deposit, Fill, RouteHistory, RouteUpdate, SlowFillRequest, TokensBridged};
use crate::finalizer::{BridgeConnector, Finalizer};
use crate::lifecycle::{
    derive_ranges, BundleStatus, ExecutionSummary, HubPool, LifecycleController, PendingBundle,
    PendingVerdict,
};
use crate::metrics;

use ethers::types::{Address, H256, U256};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything one pass read from the chains, kept as a superset view so
/// in-range fills can resolve deposits observed before the ranges
#[derive(Default)]
struct EventView {
    deposits: Vec<Deposit>,
    fills: Vec<Fill>,
    slow_fill_requests: Vec<SlowFillRequest>,
    route_updates: Vec<RouteUpdate>,
    tokens_bridged: HashMap<u64, Vec<TokensBridged>>,
}

/// Outcome summary of one pass
#[derive(Debug, Default, serde::Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub block_ranges: Vec<BundleBlockRange>,
    pub proposal_tx: Option<H256>,
    pub disputed: bool,
    pub rebalance: ExecutionSummary,
    pub refunds: ExecutionSummary,
    pub withdrawals_proven: usize,
    pub withdrawals_finalized: usize,
}

pub struct SettlementEngine {
    settings: Settings,
    tokens: TokenMap,
    registry: Arc<ChainRegistry>,
    hub: Arc<dyn HubPool>,
    controller: LifecycleController,
    finalizer: Finalizer,
    connectors: HashMap<u64, Arc<dyn BridgeConnector>>,
}

impl SettlementEngine {
    pub fn new(
        settings: Settings,
        tokens: TokenMap,
        registry: Arc<ChainRegistry>,
        hub: Arc<dyn HubPool>,
        finalizer: Finalizer,
        connectors: HashMap<u64, Arc<dyn BridgeConnector>>,
    ) -> Self {
        let controller = LifecycleController::new(hub.clone(), settings.dataworker.hub_chain_id);
        Self {
            settings,
            tokens,
            registry,
            hub,
            controller,
            finalizer,
            connectors,
        }
    }

    /// Run exactly one pass. Aborting between any two steps is safe: no
    /// partial ledger is ever proposed, and every on-chain action is
    /// re-derivable from chain history next pass.
    pub async fn run_pass(&self) -> DataworkerResult<PassReport> {
        let pass_id = Uuid::new_v4();
        let started = chrono::Utc::now();
        let mut report = PassReport {
            pass_id,
            ..Default::default()
        };

        let mut chain_ids: Vec<u64> = self
            .settings
            .enabled_chains()
            .iter()
            .map(|(_, c)| c.chain_id)
            .collect();
        chain_ids.sort_unstable();
        info!(%pass_id, chains = chain_ids.len(), "Starting settlement pass");

        // Concurrent head discovery; a missing head narrows that chain's
        // range to empty instead of failing the pass
        let heads = self.confirmed_heads(&chain_ids).await;
        let last_ends = self.hub.last_executed_end_blocks().await?;
        let mut ranges = derive_ranges(&chain_ids, &last_ends, &heads);

        let view = self.read_all(&mut ranges).await?;
        report.block_ranges = ranges.clone();
        for range in &ranges {
            metrics::record_range_end(range.chain_id, range.end_block);
        }

        let routes = RouteHistory::new(view.route_updates.clone());
        let now = self.hub.current_time().await?;
        let now_ts = now.min(u32::MAX as u64) as u32;

        // Reconciliation and leaf building complete before any write
        let ledger = reconcile(
            &ranges,
            &view.deposits,
            &view.fills,
            &view.slow_fill_requests,
            &routes,
            &self.tokens,
            now_ts,
        )?;

        if let Some(fill) = ledger.unresolved_fills.first() {
            error!(
                %pass_id,
                origin_chain_id = fill.origin_chain_id,
                deposit_id = fill.deposit_id,
                count = ledger.unresolved_fills.len(),
                "Unresolved fills require manual reconciliation; aborting pass before any write"
            );
            return Err(DataworkerError::UnresolvedFill {
                origin_chain_id: fill.origin_chain_id,
                deposit_id: fill.deposit_id,
            });
        }
        for deposit in &ledger.expired_deposits {
            warn!(
                origin_chain_id = deposit.origin_chain_id,
                deposit_id = deposit.deposit_id,
                "Deposit expired with no terminal fill; no refund"
            );
        }

        let roots = build_bundle(&ledger, &self.settings.bundle);

        match self.controller.status().await? {
            BundleStatus::NoPendingBundle => {
                self.maybe_propose(&mut report, &roots, &ranges).await?;
            }
            BundleStatus::Proposed(pending) => {
                // Someone's proposal is inside its dispute window; validate
                // it against roots re-derived from its own ranges
                let pending_roots = self.roots_for(&pending, &view, &routes, now_ts)?;
                match self.controller.check_pending(&pending, &pending_roots).await? {
                    PendingVerdict::Valid => {
                        debug!("Pending bundle matches re-derived roots; awaiting liveness");
                    }
                    PendingVerdict::Disputed { tx } => {
                        info!(tx = ?tx, "Disputed mismatching bundle");
                        metrics::record_dispute();
                        report.disputed = true;
                    }
                }
            }
            BundleStatus::LivenessPassed(pending) => {
                let pending_roots = self.roots_for(&pending, &view, &routes, now_ts)?;
                if pending.pool_rebalance_root != pending_roots.pool_rebalance.root {
                    // Too late to dispute; refuse to execute what we cannot
                    // reconstruct and surface loudly
                    return Err(DataworkerError::RootMismatch {
                        root_kind: "pool rebalance".into(),
                        computed: hex::encode(pending_roots.pool_rebalance.root),
                        expected: hex::encode(pending.pool_rebalance_root),
                    });
                }
                self.execute_leaves(&mut report, &pending, &pending_roots).await?;
            }
        }

        self.finalize_withdrawals(&mut report, &view, &heads).await?;

        metrics::flush_to_log();
        let elapsed = chrono::Utc::now() - started;
        info!(
            %pass_id,
            elapsed_ms = elapsed.num_milliseconds(),
            proposed = report.proposal_tx.is_some(),
            disputed = report.disputed,
            rebalance_executed = report.rebalance.executed,
            refunds_executed = report.refunds.executed,
            withdrawals_finalized = report.withdrawals_finalized,
            "Settlement pass complete"
        );
        Ok(report)
    }

    async fn confirmed_heads(&self, chain_ids: &[u64]) -> HashMap<u64, u64> {
        let lookups = chain_ids.iter().map(|chain_id| {
            let registry = self.registry.clone();
            let chain_id = *chain_id;
            async move {
                let reader = registry.get(chain_id)?;
                Ok::<(u64, u64), DataworkerError>((chain_id, reader.latest_block(chain_id).await?))
            }
        });

        let mut heads = HashMap::new();
        for result in join_all(lookups).await {
            match result {
                Ok((chain_id, head)) => {
                    heads.insert(chain_id, head);
                }
                Err(e) => {
                    warn!(error = %e, "Head lookup failed; chain contributes an empty range");
                }
            }
        }
        heads
    }

    /// Read every chain's range concurrently. ChainUnavailable narrows the
    /// range to empty; a suspected reorg aborts the pass before any write.
    async fn read_all(&self, ranges: &mut [BundleBlockRange]) -> DataworkerResult<EventView> {
        let lookback = self.settings.dataworker.deposit_lookback_blocks;
        let reads = ranges.iter().map(|range| {
            let registry = self.registry.clone();
            let range = *range;
            async move {
                if range.is_empty() {
                    return Ok(EventBatch {
                        chain_id: range.chain_id,
                        last_block: range.end_block,
                        ..Default::default()
                    });
                }
                let reader = registry.get(range.chain_id)?;
                reader
                    .read(
                        range.chain_id,
                        range.start_block.saturating_sub(lookback),
                        range.end_block,
                    )
                    .await
            }
        });

        let mut view = EventView::default();
        for (result, range) in join_all(reads).await.into_iter().zip(ranges.iter_mut()) {
            let batch = match result {
                Ok(batch) => batch,
                Err(e @ DataworkerError::ReorgSuspected { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        chain_id = range.chain_id,
                        error = %e,
                        "Chain read failed; narrowing its range to empty"
                    );
                    metrics::record_read_failure(range.chain_id);
                    range.end_block = range.start_block.saturating_sub(1);
                    continue;
                }
            };

            // The reader may have scanned less than asked; shrink the range
            // to what was actually covered
            if batch.last_block < range.end_block {
                range.end_block = batch.last_block.max(range.start_block.saturating_sub(1));
            }

            metrics::record_events_read(range.chain_id, "deposit", batch.deposits.len());
            metrics::record_events_read(range.chain_id, "fill", batch.fills.len());
            metrics::record_events_read(
                range.chain_id,
                "tokens_bridged",
                batch.tokens_bridged.len(),
            );

            view.deposits.extend(batch.deposits);
            view.fills.extend(batch.fills);
            view.slow_fill_requests.extend(batch.slow_fill_requests);
            view.route_updates.extend(batch.route_updates);
            view.tokens_bridged
                .entry(range.chain_id)
                .or_default()
                .extend(batch.tokens_bridged);
        }
        Ok(view)
    }

    /// Re-derive roots for a pending bundle from its own block ranges
    fn roots_for(
        &self,
        pending: &PendingBundle,
        view: &EventView,
        routes: &RouteHistory,
        now_ts: u32,
    ) -> DataworkerResult<BundleRoots> {
        let ledger = reconcile(
            &pending.block_ranges,
            &view.deposits,
            &view.fills,
            &view.slow_fill_requests,
            routes,
            &self.tokens,
            now_ts,
        )?;
        if !ledger.unresolved_fills.is_empty() {
            let fill = &ledger.unresolved_fills[0];
            return Err(DataworkerError::UnresolvedFill {
                origin_chain_id: fill.origin_chain_id,
                deposit_id: fill.deposit_id,
            });
        }
        Ok(build_bundle(&ledger, &self.settings.bundle))
    }

    async fn maybe_propose(
        &self,
        report: &mut PassReport,
        roots: &BundleRoots,
        ranges: &[BundleBlockRange],
    ) -> DataworkerResult<()> {
        let has_activity = !roots.pool_rebalance.leaves.is_empty()
            || !roots.relayer_refund.leaves.is_empty()
            || !roots.slow_relay.leaves.is_empty();
        if !has_activity {
            debug!("No settlement activity in range; skipping proposal");
            return Ok(());
        }
        if ranges.iter().all(|r| r.is_empty()) {
            debug!("All ranges empty; skipping proposal");
            return Ok(());
        }

        match self.controller.propose(roots, ranges.to_vec()).await {
            Ok(tx) => {
                metrics::record_proposal();
                report.proposal_tx = Some(tx);
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Proposal submission failed; will retry next pass");
            }
            Err(DataworkerError::Lifecycle(message)) => {
                // Another proposer won the race; our turn comes next pass
                warn!(reason = %message, "Proposal skipped");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn execute_leaves(
        &self,
        report: &mut PassReport,
        pending: &PendingBundle,
        roots: &BundleRoots,
    ) -> DataworkerResult<()> {
        let mut allocator = self.seed_allocator(roots).await;

        report.rebalance = self
            .controller
            .execute_pool_rebalance_leaves(pending, roots, &mut allocator)
            .await?;
        metrics::record_leaf_execution(
            "pool_rebalance",
            report.rebalance.executed,
            report.rebalance.skipped,
        );

        // Refund leaves need no liveness wait once the root is recorded;
        // rebalance credits from this pass already sit in the allocator
        report.refunds = self
            .controller
            .execute_relayer_refund_leaves(roots, &mut allocator)
            .await?;
        metrics::record_leaf_execution(
            "relayer_refund",
            report.refunds.executed,
            report.refunds.skipped,
        );
        Ok(())
    }

    /// Seed the pass-scoped allocator with live balances for every (chain,
    /// token) the bundle touches. A failed balance read leaves the pair at
    /// zero, deferring its leaves to a later pass.
    async fn seed_allocator(&self, roots: &BundleRoots) -> BalanceAllocator {
        let hub_chain_id = self.settings.dataworker.hub_chain_id;
        let mut keys: BTreeSet<(u64, Address)> = BTreeSet::new();
        for leaf in &roots.pool_rebalance.leaves {
            for token in &leaf.l1_tokens {
                keys.insert((hub_chain_id, *token));
            }
        }
        for leaf in &roots.relayer_refund.leaves {
            keys.insert((leaf.chain_id, leaf.l1_token));
        }

        let lookups = keys.into_iter().filter_map(|(chain_id, token)| {
            let holder = self.pool_address(chain_id)?;
            let reader = self.registry.get(chain_id).ok()?;
            Some(async move {
                let balance = reader.token_balance(chain_id, token, holder).await;
                (chain_id, token, balance)
            })
        });

        let mut snapshot: HashMap<(u64, Address), U256> = HashMap::new();
        for (chain_id, token, balance) in join_all(lookups).await {
            match balance {
                Ok(balance) => {
                    snapshot.insert((chain_id, token), balance);
                }
                Err(e) => {
                    warn!(chain_id, token = ?token, error = %e,
                        "Balance snapshot failed; pair seeded at zero");
                }
            }
        }
        BalanceAllocator::new(snapshot)
    }

    /// The contract whose balance funds executions on a chain: the hub pool
    /// on the hub chain, the spoke pool elsewhere
    fn pool_address(&self, chain_id: u64) -> Option<Address> {
        if chain_id == self.settings.dataworker.hub_chain_id {
            self.settings.dataworker.hub_pool_address.parse().ok()
        } else {
            self.settings
                .get_chain_by_id(chain_id)?
                .spoke_pool_address
                .parse()
                .ok()
        }
    }

    async fn finalize_withdrawals(
        &self,
        report: &mut PassReport,
        view: &EventView,
        heads: &HashMap<u64, u64>,
    ) -> DataworkerResult<()> {
        let mut finalizable: Vec<u64> = view.tokens_bridged.keys().copied().collect();
        finalizable.sort_unstable();
        for chain_id in &finalizable {
            let events = &view.tokens_bridged[chain_id];
            if *chain_id == self.settings.dataworker.hub_chain_id || events.is_empty() {
                continue;
            }
            let connector = match self.connectors.get(chain_id) {
                Some(connector) => connector,
                None => {
                    warn!(chain_id, "No bridge connector configured; skipping finalization");
                    continue;
                }
            };
            let chain = match self.settings.get_chain_by_id(*chain_id) {
                Some(chain) => chain,
                None => continue,
            };
            let head = heads.get(chain_id).copied().unwrap_or(0);
            let latest_block_to_finalize = head.saturating_sub(chain.finalization_delay_blocks);

            match self
                .finalizer
                .finalize_chain(chain, connector.as_ref(), events.clone(), latest_block_to_finalize)
                .await
            {
                Ok(summary) => {
                    metrics::record_finalizations(
                        *chain_id,
                        summary.proven.len(),
                        summary.finalized.len(),
                        summary.skipped,
                    );
                    report.withdrawals_proven += summary.proven.len();
                    report.withdrawals_finalized += summary.finalized.len();
                }
                Err(e) if e.is_retryable() => {
                    warn!(chain_id, error = %e, "Finalization failed; will retry next pass");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
