//! Typed settlement events extracted from spoke and hub contracts
//!
//! These are the only events the engine consumes: deposits, fills, slow fill
//! requests, route updates and tokens-bridged withdrawals. Anything else a
//! chain emits is ignored by the reader.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scale factor for relayer fee percentages (1e18 == 100%)
pub const FEE_SCALE: u128 = 1_000_000_000_000_000_000;

/// A user deposit on an origin chain, to be filled on the destination chain.
/// Unique per (origin_chain_id, deposit_id); immutable once observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub deposit_id: u32,
    pub origin_chain_id: u64,
    pub destination_chain_id: u64,
    pub depositor: Address,
    pub recipient: Address,
    pub input_token: Address,
    pub amount: U256,
    /// 1e18-scaled fee fraction paid to the relayer
    pub relayer_fee_pct: U256,
    pub quote_timestamp: u32,
    pub fill_deadline: u32,
    pub block_number: u64,
    pub transaction_hash: H256,
}

impl Deposit {
    /// Key identifying this deposit across all chains
    pub fn key(&self) -> (u64, u32) {
        (self.origin_chain_id, self.deposit_id)
    }
}

/// A relayer fill advancing funds on the destination chain. Partial fills are
/// allowed; `total_filled_amount` is the cumulative amount after this fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub deposit_id: u32,
    pub origin_chain_id: u64,
    pub destination_chain_id: u64,
    pub repayment_chain_id: u64,
    pub relayer: Address,
    pub fill_amount: U256,
    pub total_filled_amount: U256,
    pub relayer_fee_pct: U256,
    /// Zero-fee terminal fill executed from the slow relay root
    pub is_slow_relay: bool,
    pub block_number: u64,
    pub transaction_hash: H256,
}

impl Fill {
    pub fn deposit_key(&self) -> (u64, u32) {
        (self.origin_chain_id, self.deposit_id)
    }
}

/// Request to complete a deposit through the zero-fee slow relay path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowFillRequest {
    pub deposit_id: u32,
    pub origin_chain_id: u64,
    pub destination_chain_id: u64,
    pub block_number: u64,
    pub transaction_hash: H256,
}

/// Route enable/disable admin event. Effective from `effective_timestamp`;
/// deposit validity is judged against the deposit's quote timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub origin_chain_id: u64,
    pub origin_token: Address,
    pub destination_chain_id: u64,
    pub enabled: bool,
    pub effective_timestamp: u32,
    pub block_number: u64,
}

/// Emitted when a relayer refund leaf's return-to-hub portion enters the
/// chain's native bridge. Drives the cross-chain finalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensBridged {
    pub chain_id: u64,
    pub l2_token_address: Address,
    pub amount_to_return: U256,
    pub leaf_id: u32,
    pub block_number: u64,
    pub transaction_hash: H256,
}

/// Answers "was this deposit route enabled at a given time" from the observed
/// route update history. Routes with no history are treated as disabled.
#[derive(Debug, Default)]
pub struct RouteHistory {
    // (origin chain, origin token, destination chain) -> updates sorted by time
    updates: HashMap<(u64, Address, u64), Vec<(u32, bool)>>,
}

impl RouteHistory {
    pub fn new(mut events: Vec<RouteUpdate>) -> Self {
        events.sort_by_key(|e| e.effective_timestamp);
        let mut updates: HashMap<(u64, Address, u64), Vec<(u32, bool)>> = HashMap::new();
        for e in events {
            updates
                .entry((e.origin_chain_id, e.origin_token, e.destination_chain_id))
                .or_default()
                .push((e.effective_timestamp, e.enabled));
        }
        Self { updates }
    }

    /// Route state at `timestamp`: the most recent update at or before it wins
    pub fn enabled_at(
        &self,
        origin_chain_id: u64,
        origin_token: Address,
        destination_chain_id: u64,
        timestamp: u32,
    ) -> bool {
        self.updates
            .get(&(origin_chain_id, origin_token, destination_chain_id))
            .map(|history| {
                history
                    .iter()
                    .take_while(|(ts, _)| *ts <= timestamp)
                    .last()
                    .map(|(_, enabled)| *enabled)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

/// Assign each event an ordered index among events sharing its transaction
/// hash. A bridge transaction can carry several withdrawals whose messages
/// are only distinguishable by this index, so it must be assigned before any
/// status resolution.
pub fn unique_log_indexes(events: &[TokensBridged]) -> Vec<usize> {
    let mut counts: HashMap<H256, usize> = HashMap::new();
    events
        .iter()
        .map(|e| {
            let index = counts.entry(e.transaction_hash).or_insert(0);
            let assigned = *index;
            *index += 1;
            assigned
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(enabled: bool, ts: u32) -> RouteUpdate {
        RouteUpdate {
            origin_chain_id: 10,
            origin_token: Address::repeat_byte(1),
            destination_chain_id: 1,
            enabled,
            effective_timestamp: ts,
            block_number: 0,
        }
    }

    #[test]
    fn route_history_latest_update_wins() {
        let history = RouteHistory::new(vec![route(true, 100), route(false, 200)]);
        let token = Address::repeat_byte(1);

        assert!(!history.enabled_at(10, token, 1, 50));
        assert!(history.enabled_at(10, token, 1, 100));
        assert!(history.enabled_at(10, token, 1, 150));
        assert!(!history.enabled_at(10, token, 1, 200));
        assert!(!history.enabled_at(10, token, 1, 999));
    }

    #[test]
    fn route_history_unknown_route_is_disabled() {
        let history = RouteHistory::new(vec![]);
        assert!(!history.enabled_at(10, Address::repeat_byte(9), 1, 100));
    }

    #[test]
    fn unique_log_indexes_count_per_transaction() {
        let tx_a = H256::repeat_byte(0xaa);
        let tx_b = H256::repeat_byte(0xbb);
        let event = |tx: H256, leaf_id: u32| TokensBridged {
            chain_id: 10,
            l2_token_address: Address::zero(),
            amount_to_return: U256::from(1u64),
            leaf_id,
            block_number: 1,
            transaction_hash: tx,
        };

        let events = vec![event(tx_a, 0), event(tx_a, 1), event(tx_b, 0), event(tx_a, 2)];
        assert_eq!(unique_log_indexes(&events), vec![0, 1, 0, 2]);
    }
}
