//! Cross-chain withdrawal finalization
//!
//! When an executed relayer refund leaf returns funds toward the hub, the
//! transfer travels over the chain's native bridge and must be walked through
//! that bridge's prove/finalize handshake before the hub recognizes it. This
//! module drives one finalization pass per chain: resolve each TokensBridged
//! event to its bridge message (deduplicating withdrawals that share a
//! transaction by ordered log index), query bridge status, then submit one
//! aggregated prove batch and one aggregated finalize batch.

pub mod connector;
pub mod families;

pub use connector::{RpcBridgeConnector, RpcCallAggregator};
pub use families::{phase_spec, PhaseSpec};

use crate::config::{ChainConfig, ProtocolFamily, TokenMap};
use crate::error::DataworkerResult;
use crate::events::{unique_log_indexes, TokensBridged};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle position of one withdrawal within its bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Unconfirmed,
    ReadyToProve,
    Proved,
    ReadyToFinalize,
    Finalized,
}

/// Resolved native-bridge message for one withdrawal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMessage {
    pub chain_id: u64,
    pub transaction_hash: H256,
    /// Ordered index among withdrawals sharing the transaction
    pub log_index: usize,
    pub nonce: U256,
}

impl BridgeMessage {
    /// Message encoding version, embedded in the upper 16 bits of the nonce
    pub fn version(&self) -> u16 {
        (self.nonce >> 240).as_u32() as u16
    }
}

/// One withdrawal tracked through finalization, with its resolved token and
/// decimal-normalized amount for downstream accounting
#[derive(Debug, Clone)]
pub struct CrossChainWithdrawal {
    pub chain_id: u64,
    pub token_symbol: String,
    pub amount: String,
    pub source_event: TokensBridged,
    pub protocol_family: ProtocolFamily,
    pub status: WithdrawalStatus,
}

/// One call routed through the generic multicall aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateCall {
    pub target: Address,
    pub call_data: Bytes,
}

/// Bridge-specific message resolution and call construction for one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeConnector: Send + Sync {
    async fn resolve_message(
        &self,
        event: TokensBridged,
        log_index: usize,
    ) -> DataworkerResult<BridgeMessage>;

    async fn message_status(&self, message: BridgeMessage) -> DataworkerResult<WithdrawalStatus>;

    async fn prove_call(&self, message: BridgeMessage) -> DataworkerResult<AggregateCall>;

    async fn finalize_call(&self, message: BridgeMessage) -> DataworkerResult<AggregateCall>;
}

/// Externally supplied multicall boundary: many calls, one transaction
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallAggregator: Send + Sync {
    async fn submit(&self, calls: Vec<AggregateCall>) -> DataworkerResult<H256>;
}

/// Per-chain finalization outcome
#[derive(Debug, Default)]
pub struct FinalizationSummary {
    pub proven: Vec<CrossChainWithdrawal>,
    pub finalized: Vec<CrossChainWithdrawal>,
    /// Pre-upgrade messages and unmapped tokens, skipped with a warning
    pub skipped: usize,
    pub prove_tx: Option<H256>,
    pub finalize_tx: Option<H256>,
}

pub struct Finalizer {
    aggregator: Arc<dyn CallAggregator>,
    tokens: TokenMap,
    min_message_version: u16,
}

impl Finalizer {
    pub fn new(
        aggregator: Arc<dyn CallAggregator>,
        tokens: TokenMap,
        min_message_version: u16,
    ) -> Self {
        Self {
            aggregator,
            tokens,
            min_message_version,
        }
    }

    /// Run one finalization pass for one chain. Events newer than
    /// `latest_block_to_finalize` are candidates for proving, older ones for
    /// finalizing; actual bridge status gates both, so re-running over
    /// already-finalized withdrawals is a no-op.
    pub async fn finalize_chain(
        &self,
        chain: &ChainConfig,
        connector: &dyn BridgeConnector,
        events: Vec<TokensBridged>,
        latest_block_to_finalize: u64,
    ) -> DataworkerResult<FinalizationSummary> {
        let family = phase_spec(chain.protocol_family);
        let mut summary = FinalizationSummary::default();

        if events.is_empty() {
            return Ok(summary);
        }
        debug!(
            chain_id = chain.chain_id,
            family = family.name,
            events = events.len(),
            latest_block_to_finalize,
            "Starting finalization pass"
        );

        let log_indexes = unique_log_indexes(&events);
        let earliest_block_to_prove = latest_block_to_finalize + 1;

        let mut prove_calls = Vec::new();
        let mut finalize_calls = Vec::new();

        for (event, log_index) in events.into_iter().zip(log_indexes) {
            let message = connector.resolve_message(event.clone(), log_index).await?;

            if message.version() < self.min_message_version {
                // Known transitional condition around protocol upgrades
                warn!(
                    chain_id = chain.chain_id,
                    tx = ?event.transaction_hash,
                    version = message.version(),
                    "Dropping withdrawal with pre-upgrade message encoding"
                );
                summary.skipped += 1;
                continue;
            }

            let raw_status = connector.message_status(message.clone()).await?;
            // Families without a prove phase can never sit in ReadyToProve;
            // normalize per the dispatch table
            let status = match raw_status {
                WithdrawalStatus::ReadyToProve if !family.has_prove_phase => {
                    WithdrawalStatus::ReadyToFinalize
                }
                other => other,
            };

            let withdrawal = match self.describe(chain, &event, status) {
                Some(withdrawal) => withdrawal,
                None => {
                    summary.skipped += 1;
                    continue;
                }
            };

            match status {
                WithdrawalStatus::ReadyToProve
                    if event.block_number >= earliest_block_to_prove =>
                {
                    prove_calls.push(connector.prove_call(message).await?);
                    summary.proven.push(withdrawal);
                }
                WithdrawalStatus::ReadyToFinalize
                    if event.block_number <= latest_block_to_finalize =>
                {
                    finalize_calls.push(connector.finalize_call(message).await?);
                    summary.finalized.push(withdrawal);
                }
                WithdrawalStatus::Finalized => {
                    debug!(
                        chain_id = chain.chain_id,
                        tx = ?event.transaction_hash,
                        "Withdrawal already finalized; skipping"
                    );
                }
                _ => {
                    debug!(
                        chain_id = chain.chain_id,
                        tx = ?event.transaction_hash,
                        status = ?status,
                        "Withdrawal not actionable this pass"
                    );
                }
            }
        }

        // One aggregated submission per phase amortizes transaction cost
        if !prove_calls.is_empty() {
            let tx = self.aggregator.submit(prove_calls).await?;
            info!(chain_id = chain.chain_id, count = summary.proven.len(), tx = ?tx,
                "Submitted aggregated withdrawal proofs");
            for withdrawal in &mut summary.proven {
                withdrawal.status = WithdrawalStatus::Proved;
            }
            summary.prove_tx = Some(tx);
        }
        if !finalize_calls.is_empty() {
            let tx = self.aggregator.submit(finalize_calls).await?;
            info!(chain_id = chain.chain_id, count = summary.finalized.len(), tx = ?tx,
                "Submitted aggregated withdrawal finalizations");
            for withdrawal in &mut summary.finalized {
                withdrawal.status = WithdrawalStatus::Finalized;
            }
            summary.finalize_tx = Some(tx);
        }

        Ok(summary)
    }

    /// Resolve the withdrawal's L1 token and decimal-normalized amount
    fn describe(
        &self,
        chain: &ChainConfig,
        event: &TokensBridged,
        status: WithdrawalStatus,
    ) -> Option<CrossChainWithdrawal> {
        let l1_token = match self.tokens.l1_token(chain.chain_id, event.l2_token_address) {
            Ok(token) => token,
            Err(_) => {
                warn!(
                    chain_id = chain.chain_id,
                    token = ?event.l2_token_address,
                    "No L1 mapping for bridged token; skipping withdrawal"
                );
                return None;
            }
        };
        let info = self.tokens.info(l1_token)?;
        let amount = ethers::utils::format_units(event.amount_to_return, info.decimals as u32)
            .unwrap_or_else(|_| event.amount_to_return.to_string());

        Some(CrossChainWithdrawal {
            chain_id: chain.chain_id,
            token_symbol: info.symbol.clone(),
            amount,
            source_event: event.clone(),
            protocol_family: chain.protocol_family,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{L2TokenAddress, TokenConfig};
    use mockall::predicate::{always, eq};

    const CHAIN: u64 = 10;

    fn chain_config(family: ProtocolFamily) -> ChainConfig {
        ChainConfig {
            chain_id: CHAIN,
            name: "opchain".into(),
            rpc_url: "http://localhost:9545".into(),
            spoke_pool_address: "0x00000000000000000000000000000000000000bb".into(),
            confirmation_blocks: 64,
            protocol_family: family,
            bridge_portal_address: "0x00000000000000000000000000000000000000ee".into(),
            finalization_delay_blocks: 100,
            enabled: true,
        }
    }

    fn tokens() -> TokenMap {
        TokenMap::from_configs(&[TokenConfig {
            symbol: "USDC".into(),
            decimals: 6,
            l1_address: "0x0000000000000000000000000000000000000001".into(),
            l2_addresses: vec![L2TokenAddress {
                chain_id: CHAIN,
                address: "0x0000000000000000000000000000000000000002".into(),
            }],
        }])
        .unwrap()
    }

    fn event(block_number: u64, tx_byte: u8) -> TokensBridged {
        TokensBridged {
            chain_id: CHAIN,
            l2_token_address: "0x0000000000000000000000000000000000000002"
                .parse()
                .unwrap(),
            amount_to_return: U256::from(100_000_000u64), // 100 USDC
            leaf_id: 0,
            block_number,
            transaction_hash: H256::repeat_byte(tx_byte),
        }
    }

    fn message(event: &TokensBridged, log_index: usize, version: u16) -> BridgeMessage {
        BridgeMessage {
            chain_id: CHAIN,
            transaction_hash: event.transaction_hash,
            log_index,
            nonce: U256::from(version) << 240 | U256::from(7u64),
        }
    }

    fn resolver_for(version: u16) -> impl Fn(TokensBridged, usize) -> DataworkerResult<BridgeMessage>
    {
        move |event: TokensBridged, log_index: usize| Ok(message(&event, log_index, version))
    }

    #[tokio::test]
    async fn two_phase_withdrawal_proves_then_finalizes_after_delay() {
        let chain = chain_config(ProtocolFamily::Optimistic);
        let withdrawal = event(500, 0x11);

        // Pass 1: the event is recent, bridge says ReadyToProve
        let mut connector = MockBridgeConnector::new();
        let resolve = resolver_for(1);
        connector
            .expect_resolve_message()
            .returning(move |e, i| resolve(e, i));
        connector
            .expect_message_status()
            .returning(|_| Ok(WithdrawalStatus::ReadyToProve));
        connector.expect_prove_call().times(1).returning(|m| {
            Ok(AggregateCall {
                target: Address::repeat_byte(0xee),
                call_data: Bytes::from(m.transaction_hash.as_bytes().to_vec()),
            })
        });
        connector.expect_finalize_call().never();

        let mut aggregator = MockCallAggregator::new();
        aggregator
            .expect_submit()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0xaa)));

        let finalizer = Finalizer::new(Arc::new(aggregator), tokens(), 1);
        let summary = finalizer
            .finalize_chain(&chain, &connector, vec![withdrawal.clone()], 400)
            .await
            .unwrap();

        assert_eq!(summary.proven.len(), 1);
        assert_eq!(summary.proven[0].status, WithdrawalStatus::Proved);
        assert_eq!(summary.proven[0].token_symbol, "USDC");
        assert_eq!(summary.proven[0].amount, "100.000000");
        assert!(summary.finalized.is_empty());

        // Pass 2: proved but the confirmation delay has not elapsed; no-op
        let mut connector = MockBridgeConnector::new();
        let resolve = resolver_for(1);
        connector
            .expect_resolve_message()
            .returning(move |e, i| resolve(e, i));
        connector
            .expect_message_status()
            .returning(|_| Ok(WithdrawalStatus::Proved));
        connector.expect_prove_call().never();
        connector.expect_finalize_call().never();

        let aggregator = MockCallAggregator::new(); // no submissions expected
        let finalizer = Finalizer::new(Arc::new(aggregator), tokens(), 1);
        let summary = finalizer
            .finalize_chain(&chain, &connector, vec![withdrawal.clone()], 400)
            .await
            .unwrap();
        assert!(summary.proven.is_empty());
        assert!(summary.finalized.is_empty());

        // Pass 3: delay elapsed, bridge says ReadyToFinalize
        let mut connector = MockBridgeConnector::new();
        let resolve = resolver_for(1);
        connector
            .expect_resolve_message()
            .returning(move |e, i| resolve(e, i));
        connector
            .expect_message_status()
            .returning(|_| Ok(WithdrawalStatus::ReadyToFinalize));
        connector.expect_finalize_call().times(1).returning(|m| {
            Ok(AggregateCall {
                target: Address::repeat_byte(0xee),
                call_data: Bytes::from(m.transaction_hash.as_bytes().to_vec()),
            })
        });

        let mut aggregator = MockCallAggregator::new();
        aggregator
            .expect_submit()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0xbb)));

        let finalizer = Finalizer::new(Arc::new(aggregator), tokens(), 1);
        let summary = finalizer
            .finalize_chain(&chain, &connector, vec![withdrawal], 600)
            .await
            .unwrap();
        assert_eq!(summary.finalized.len(), 1);
        assert_eq!(summary.finalized[0].status, WithdrawalStatus::Finalized);
    }

    #[tokio::test]
    async fn finalized_withdrawal_is_a_no_op() {
        let chain = chain_config(ProtocolFamily::Optimistic);

        let mut connector = MockBridgeConnector::new();
        let resolve = resolver_for(1);
        connector
            .expect_resolve_message()
            .returning(move |e, i| resolve(e, i));
        connector
            .expect_message_status()
            .returning(|_| Ok(WithdrawalStatus::Finalized));
        connector.expect_prove_call().never();
        connector.expect_finalize_call().never();

        let aggregator = MockCallAggregator::new();
        let finalizer = Finalizer::new(Arc::new(aggregator), tokens(), 1);
        let summary = finalizer
            .finalize_chain(&chain, &connector, vec![event(500, 0x22)], 600)
            .await
            .unwrap();

        assert!(summary.proven.is_empty());
        assert!(summary.finalized.is_empty());
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn pre_upgrade_messages_are_dropped_with_a_warning() {
        let chain = chain_config(ProtocolFamily::Optimistic);

        let mut connector = MockBridgeConnector::new();
        let resolve = resolver_for(0); // version below the minimum
        connector
            .expect_resolve_message()
            .returning(move |e, i| resolve(e, i));
        connector.expect_message_status().never();

        let aggregator = MockCallAggregator::new();
        let finalizer = Finalizer::new(Arc::new(aggregator), tokens(), 1);
        let summary = finalizer
            .finalize_chain(&chain, &connector, vec![event(500, 0x33)], 600)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert!(summary.proven.is_empty());
    }

    #[tokio::test]
    async fn shared_transaction_withdrawals_get_ordered_log_indexes() {
        let chain = chain_config(ProtocolFamily::Delayed);
        let first = event(100, 0x44);
        let second = event(100, 0x44); // same transaction

        let mut connector = MockBridgeConnector::new();
        let resolve = resolver_for(1);
        connector
            .expect_resolve_message()
            .with(always(), eq(0usize))
            .times(1)
            .returning({
                let resolve = resolver_for(1);
                move |e, i| resolve(e, i)
            });
        connector
            .expect_resolve_message()
            .with(always(), eq(1usize))
            .times(1)
            .returning(move |e, i| resolve(e, i));
        // No prove phase: the bridge reports delay elapsed via ReadyToFinalize
        connector
            .expect_message_status()
            .returning(|_| Ok(WithdrawalStatus::ReadyToFinalize));
        connector
            .expect_finalize_call()
            .times(2)
            .returning(|m| {
                Ok(AggregateCall {
                    target: Address::repeat_byte(0xee),
                    call_data: Bytes::from(vec![m.log_index as u8]),
                })
            });

        let mut aggregator = MockCallAggregator::new();
        aggregator
            .expect_submit()
            .withf(|calls| calls.len() == 2)
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0xcc)));

        let finalizer = Finalizer::new(Arc::new(aggregator), tokens(), 1);
        let summary = finalizer
            .finalize_chain(&chain, &connector, vec![first, second], 600)
            .await
            .unwrap();

        assert_eq!(summary.finalized.len(), 2);
    }
}
