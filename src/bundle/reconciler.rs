//! Bundle data reconciliation
//!
//! Matches fills to deposits across all chains for one bundle's block ranges
//! and produces the canonical settlement ledger: relayer refunds, LP fees,
//! slow relay amounts and per-chain token flows. The ledger's maps are
//! ordered, so identical inputs yield an identical ledger regardless of the
//! order events were read in.

use crate::bundle::BundleBlockRange;
use crate::config::TokenMap;
use crate::error::DataworkerResult;
use crate::events::{Deposit, Fill, RouteHistory, SlowFillRequest, FEE_SCALE};

use ethers::types::{Address, I256, U256};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Key of one refund ledger entry: (repayment chain, L1 token, relayer)
pub type RefundKey = (u64, Address, Address);

/// Key of one per-chain token flow: (chain, L1 token)
pub type FlowKey = (u64, Address);

/// A deposit remainder settling through the zero-fee slow relay root
#[derive(Debug, Clone)]
pub struct SlowRelay {
    pub deposit: Deposit,
    pub l1_token: Address,
    pub amount: U256,
}

/// Canonical output of reconciliation for one bundle
#[derive(Debug, Default)]
pub struct SettlementLedger {
    /// Net amount owed per (repayment chain, L1 token, relayer)
    pub refunds: BTreeMap<RefundKey, U256>,
    /// Fee portion of fills, retained by the hub's liquidity providers
    pub lp_fees: BTreeMap<FlowKey, U256>,
    /// Deposited amounts received by each spoke in-range
    pub deposit_inflow: BTreeMap<FlowKey, U256>,
    /// Refund amounts each spoke must pay out
    pub refund_outflow: BTreeMap<FlowKey, U256>,
    /// Slow relay amounts each destination spoke must cover
    pub slow_fill_outflow: BTreeMap<FlowKey, U256>,
    /// Deposit remainders committed to the slow relay root, ordered by
    /// (origin chain, deposit id)
    pub slow_relays: Vec<SlowRelay>,
    /// Fills that resolve to no known deposit; fatal for the pass
    pub unresolved_fills: Vec<Fill>,
    /// Deposits past their fill deadline with no terminal fill
    pub expired_deposits: Vec<Deposit>,
}

impl SettlementLedger {
    /// Net amount the hub must send each spoke (positive) or the spoke must
    /// return (negative): refunds + slow relays due minus deposits received.
    pub fn net_send_deltas(&self) -> BTreeMap<FlowKey, I256> {
        let mut deltas: BTreeMap<FlowKey, I256> = BTreeMap::new();
        let mut apply = |flows: &BTreeMap<FlowKey, U256>, sign: i8| {
            for (key, amount) in flows {
                let amount = I256::try_from(*amount).unwrap_or(I256::MAX);
                let signed = if sign < 0 { -amount } else { amount };
                let entry = deltas.entry(*key).or_insert_with(I256::zero);
                *entry = entry.saturating_add(signed);
            }
        };
        apply(&self.refund_outflow, 1);
        apply(&self.slow_fill_outflow, 1);
        apply(&self.deposit_inflow, -1);
        deltas.retain(|_, v| !v.is_zero());
        deltas
    }
}

/// Reconcile one bundle's events into the settlement ledger.
///
/// `deposits`, `fills` and `slow_fill_requests` are superset views: a fill
/// inside the ranges may satisfy a deposit observed before them. Only fills
/// and requests inside the ranges, and deposits inside the ranges, carry
/// accounting weight.
pub fn reconcile(
    ranges: &[BundleBlockRange],
    deposits: &[Deposit],
    fills: &[Fill],
    slow_fill_requests: &[SlowFillRequest],
    routes: &RouteHistory,
    tokens: &TokenMap,
    current_time: u32,
) -> DataworkerResult<SettlementLedger> {
    let range_by_chain: HashMap<u64, &BundleBlockRange> =
        ranges.iter().map(|r| (r.chain_id, r)).collect();
    let in_range = |chain_id: u64, block: u64| {
        range_by_chain
            .get(&chain_id)
            .map(|r| r.contains(block))
            .unwrap_or(false)
    };

    // Index deposits by (origin chain, deposit id). First observation wins;
    // deposits are immutable so a duplicate is a reader artifact.
    let mut deposit_index: HashMap<(u64, u32), &Deposit> = HashMap::new();
    for deposit in deposits {
        deposit_index.entry(deposit.key()).or_insert(deposit);
    }

    let mut ledger = SettlementLedger::default();

    // Route validity at quote time. Later disablement does not retroactively
    // invalidate deposits that were quoted while the route was enabled.
    let route_valid = |deposit: &Deposit| {
        routes.enabled_at(
            deposit.origin_chain_id,
            deposit.input_token,
            deposit.destination_chain_id,
            deposit.quote_timestamp,
        )
    };

    // Cumulative ordinary fill amounts per deposit, across the whole superset
    // view, used to size slow relay remainders.
    let mut ordinary_filled: HashMap<(u64, u32), U256> = HashMap::new();
    // Deposits touched by in-range activity that can require a slow relay
    let mut slow_candidates: HashSet<(u64, u32)> = HashSet::new();
    // Deposits completed by a terminal slow fill
    let mut slow_completed: HashSet<(u64, u32)> = HashSet::new();

    for fill in fills {
        let key = fill.deposit_key();
        let deposit = match deposit_index.get(&key) {
            Some(deposit) => *deposit,
            None => {
                if in_range(fill.destination_chain_id, fill.block_number) {
                    // The one condition the engine cannot repair locally
                    ledger.unresolved_fills.push(fill.clone());
                }
                continue;
            }
        };

        if fill.destination_chain_id != deposit.destination_chain_id {
            if in_range(fill.destination_chain_id, fill.block_number) {
                ledger.unresolved_fills.push(fill.clone());
            }
            continue;
        }

        if fill.is_slow_relay {
            if fill.total_filled_amount >= deposit.amount {
                slow_completed.insert(key);
            }
        } else {
            let filled = ordinary_filled.entry(key).or_default();
            *filled = filled.saturating_add(fill.fill_amount);
        }

        if !in_range(fill.destination_chain_id, fill.block_number) {
            continue;
        }

        if !route_valid(deposit) {
            warn!(
                origin_chain_id = deposit.origin_chain_id,
                deposit_id = deposit.deposit_id,
                "Skipping fill of deposit whose route was disabled at quote time"
            );
            continue;
        }

        let l1_token = tokens.l1_token(deposit.origin_chain_id, deposit.input_token)?;

        if fill.is_slow_relay {
            // Slow-filled amounts settle through the slow relay root at zero
            // fee; they never enter the ordinary refund ledger.
            slow_candidates.insert(key);
            continue;
        }

        // Ordinary fill: fee-net refund to the relayer on its repayment
        // chain, fee portion accrued to the LP accounting of the same chain.
        let refund = fill.fill_amount * (U256::from(FEE_SCALE) - fill.relayer_fee_pct)
            / U256::from(FEE_SCALE);
        let fee = fill.fill_amount - refund;

        let refund_key = (fill.repayment_chain_id, l1_token, fill.relayer);
        let entry = ledger.refunds.entry(refund_key).or_default();
        *entry = entry.saturating_add(refund);

        let flow_key = (fill.repayment_chain_id, l1_token);
        let outflow = ledger.refund_outflow.entry(flow_key).or_default();
        *outflow = outflow.saturating_add(refund);
        let fees = ledger.lp_fees.entry(flow_key).or_default();
        *fees = fees.saturating_add(fee);

        if fill.total_filled_amount < deposit.amount {
            slow_candidates.insert(key);
        }
    }

    for request in slow_fill_requests {
        if in_range(request.destination_chain_id, request.block_number) {
            slow_candidates.insert((request.origin_chain_id, request.deposit_id));
        }
    }

    // Classify deposits: in-range valid deposits contribute inflow; expired
    // deposits are surfaced and carry no further weight. Iterate the index in
    // key order so the ledger's lists are canonical.
    let mut deposit_keys: Vec<(u64, u32)> = deposit_index.keys().copied().collect();
    deposit_keys.sort();
    for key in deposit_keys {
        let deposit = deposit_index[&key];

        if !route_valid(deposit) {
            if in_range(deposit.origin_chain_id, deposit.block_number) {
                debug!(
                    origin_chain_id = deposit.origin_chain_id,
                    deposit_id = deposit.deposit_id,
                    "Ignoring deposit with disabled route"
                );
            }
            continue;
        }

        let filled = ordinary_filled
            .get(&deposit.key())
            .copied()
            .unwrap_or_default();
        // Past-deadline with no terminal fill, ordinary or slow
        let expired = deposit.fill_deadline < current_time
            && filled < deposit.amount
            && !slow_completed.contains(&deposit.key());

        if expired {
            if in_range(deposit.origin_chain_id, deposit.block_number) {
                ledger.expired_deposits.push(deposit.clone());
            }
            continue;
        }

        if in_range(deposit.origin_chain_id, deposit.block_number) {
            let l1_token = tokens.l1_token(deposit.origin_chain_id, deposit.input_token)?;
            let inflow = ledger
                .deposit_inflow
                .entry((deposit.origin_chain_id, l1_token))
                .or_default();
            *inflow = inflow.saturating_add(deposit.amount);
        }
    }

    // Size slow relay remainders from cumulative ordinary fills
    let mut slow_keys: Vec<(u64, u32)> = slow_candidates.into_iter().collect();
    slow_keys.sort();
    for key in slow_keys {
        let deposit = match deposit_index.get(&key) {
            Some(deposit) => *deposit,
            None => continue, // already reported as unresolved via its fill
        };
        if deposit.fill_deadline < current_time && !slow_completed.contains(&key) {
            continue; // lapsed before any slow fill landed; surfaced as expired
        }
        let filled = ordinary_filled.get(&key).copied().unwrap_or_default();
        if filled >= deposit.amount {
            continue; // completed by ordinary fills after all
        }
        let amount = deposit.amount - filled;
        let l1_token = tokens.l1_token(deposit.origin_chain_id, deposit.input_token)?;

        let outflow = ledger
            .slow_fill_outflow
            .entry((deposit.destination_chain_id, l1_token))
            .or_default();
        *outflow = outflow.saturating_add(amount);
        ledger.slow_relays.push(SlowRelay {
            deposit: deposit.clone(),
            l1_token,
            amount,
        });
    }

    debug!(
        refunds = ledger.refunds.len(),
        slow_relays = ledger.slow_relays.len(),
        unresolved = ledger.unresolved_fills.len(),
        expired = ledger.expired_deposits.len(),
        "Reconciliation complete"
    );

    Ok(ledger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{L2TokenAddress, TokenConfig};
    use ethers::types::H256;

    const ORIGIN: u64 = 10;
    const DEST: u64 = 42161;

    fn l1_token() -> Address {
        "0x0000000000000000000000000000000000000001".parse().unwrap()
    }

    fn origin_token() -> Address {
        "0x0000000000000000000000000000000000000002".parse().unwrap()
    }

    fn token_map() -> TokenMap {
        TokenMap::from_configs(&[TokenConfig {
            symbol: "WETH".into(),
            decimals: 18,
            l1_address: format!("{:?}", l1_token()),
            l2_addresses: vec![
                L2TokenAddress {
                    chain_id: ORIGIN,
                    address: format!("{:?}", origin_token()),
                },
                L2TokenAddress {
                    chain_id: DEST,
                    address: "0x0000000000000000000000000000000000000003".into(),
                },
            ],
        }])
        .unwrap()
    }

    fn open_routes() -> RouteHistory {
        RouteHistory::new(vec![crate::events::RouteUpdate {
            origin_chain_id: ORIGIN,
            origin_token: origin_token(),
            destination_chain_id: DEST,
            enabled: true,
            effective_timestamp: 0,
            block_number: 0,
        }])
    }

    fn ranges() -> Vec<BundleBlockRange> {
        vec![
            BundleBlockRange { chain_id: ORIGIN, start_block: 100, end_block: 200 },
            BundleBlockRange { chain_id: DEST, start_block: 500, end_block: 600 },
        ]
    }

    fn deposit(id: u32, amount: u64) -> Deposit {
        Deposit {
            deposit_id: id,
            origin_chain_id: ORIGIN,
            destination_chain_id: DEST,
            depositor: Address::repeat_byte(0xd0),
            recipient: Address::repeat_byte(0xd1),
            input_token: origin_token(),
            amount: U256::from(amount),
            relayer_fee_pct: U256::from(FEE_SCALE / 100), // 1%
            quote_timestamp: 1_000,
            fill_deadline: 10_000,
            block_number: 150,
            transaction_hash: H256::repeat_byte(id as u8 + 1),
        }
    }

    fn fill_for(deposit: &Deposit, amount: u64, total: u64, slow: bool) -> Fill {
        Fill {
            deposit_id: deposit.deposit_id,
            origin_chain_id: deposit.origin_chain_id,
            destination_chain_id: deposit.destination_chain_id,
            repayment_chain_id: DEST,
            relayer: Address::repeat_byte(0xee),
            fill_amount: U256::from(amount),
            total_filled_amount: U256::from(total),
            relayer_fee_pct: if slow { U256::zero() } else { deposit.relayer_fee_pct },
            is_slow_relay: slow,
            block_number: 550,
            transaction_hash: H256::repeat_byte(0x42),
        }
    }

    #[test]
    fn single_full_fill_accrues_fee_net_refund() {
        // Deposit of 1000 wei-units, one full fill at 1% fee
        let d = deposit(1, 1_000);
        let f = fill_for(&d, 1_000, 1_000, false);

        let ledger = reconcile(
            &ranges(),
            &[d],
            &[f.clone()],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        let key = (DEST, l1_token(), f.relayer);
        assert_eq!(ledger.refunds.get(&key), Some(&U256::from(990u64)));
        assert_eq!(
            ledger.lp_fees.get(&(DEST, l1_token())),
            Some(&U256::from(10u64))
        );
        assert!(ledger.slow_relays.is_empty());
        assert!(ledger.unresolved_fills.is_empty());

        // Hub sends the destination 990 and recovers 1000 from the origin
        let deltas = ledger.net_send_deltas();
        assert_eq!(deltas.get(&(DEST, l1_token())), Some(&I256::from(990)));
        assert_eq!(deltas.get(&(ORIGIN, l1_token())), Some(&I256::from(-1_000)));
    }

    #[test]
    fn slow_fill_completion_is_never_double_counted() {
        // Filled 5 of 10 ordinarily, slow fill completes the remaining 5
        let d = deposit(2, 10);
        let partial = fill_for(&d, 5, 5, false);
        let slow = fill_for(&d, 5, 10, true);

        let ledger = reconcile(
            &ranges(),
            &[d],
            &[partial.clone(), slow],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        // One ordinary refund entry for the partial fill only
        let key = (DEST, l1_token(), partial.relayer);
        let expected = U256::from(5u64) * U256::from(FEE_SCALE - FEE_SCALE / 100)
            / U256::from(FEE_SCALE);
        assert_eq!(ledger.refunds.len(), 1);
        assert_eq!(ledger.refunds.get(&key), Some(&expected));

        // The remaining 5 appears only through the slow relay root
        assert_eq!(ledger.slow_relays.len(), 1);
        assert_eq!(ledger.slow_relays[0].amount, U256::from(5u64));
        assert_eq!(
            ledger.slow_fill_outflow.get(&(DEST, l1_token())),
            Some(&U256::from(5u64))
        );
    }

    #[test]
    fn partial_fill_without_completion_creates_slow_relay_remainder() {
        let d = deposit(3, 10);
        let partial = fill_for(&d, 4, 4, false);

        let ledger = reconcile(
            &ranges(),
            &[d],
            &[partial],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        assert_eq!(ledger.slow_relays.len(), 1);
        assert_eq!(ledger.slow_relays[0].amount, U256::from(6u64));
    }

    #[test]
    fn expired_deposit_is_surfaced_without_refund() {
        let mut d = deposit(4, 100);
        d.fill_deadline = 1_500;

        let ledger = reconcile(
            &ranges(),
            &[d],
            &[],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        assert_eq!(ledger.expired_deposits.len(), 1);
        assert!(ledger.refunds.is_empty());
        assert!(ledger.slow_relays.is_empty());
        assert!(ledger.deposit_inflow.is_empty());
    }

    #[test]
    fn fill_with_unknown_deposit_is_flagged() {
        let d = deposit(5, 100);
        let mut f = fill_for(&d, 100, 100, false);
        f.deposit_id = 999; // no such deposit anywhere

        let ledger = reconcile(
            &ranges(),
            &[d],
            &[f],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        assert_eq!(ledger.unresolved_fills.len(), 1);
        assert!(ledger.refunds.is_empty());
    }

    #[test]
    fn fill_of_route_disabled_deposit_is_skipped_not_fatal() {
        let d = deposit(6, 100);
        let f = fill_for(&d, 100, 100, false);
        // No route history at all: disabled at quote time
        let ledger = reconcile(
            &ranges(),
            &[d],
            &[f],
            &[],
            &RouteHistory::new(vec![]),
            &token_map(),
            2_000,
        )
        .unwrap();

        assert!(ledger.unresolved_fills.is_empty());
        assert!(ledger.refunds.is_empty());
        assert!(ledger.deposit_inflow.is_empty());
    }

    #[test]
    fn fill_satisfying_pre_range_deposit_is_honored() {
        let mut d = deposit(7, 1_000);
        d.block_number = 50; // before this bundle's origin range
        let f = fill_for(&d, 1_000, 1_000, false);

        let ledger = reconcile(
            &ranges(),
            &[d],
            &[f.clone()],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        // Refund accrues; no deposit inflow since the deposit is out of range
        assert_eq!(ledger.refunds.len(), 1);
        assert!(ledger.deposit_inflow.is_empty());
    }

    #[test]
    fn ledger_is_identical_regardless_of_event_order() {
        let d1 = deposit(8, 1_000);
        let d2 = deposit(9, 500);
        let f1 = fill_for(&d1, 600, 600, false);
        let f2 = fill_for(&d1, 400, 1_000, false);
        let f3 = fill_for(&d2, 500, 500, false);

        let forward = reconcile(
            &ranges(),
            &[d1.clone(), d2.clone()],
            &[f1.clone(), f2.clone(), f3.clone()],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        let backward = reconcile(
            &ranges(),
            &[d2, d1],
            &[f3, f2, f1],
            &[],
            &open_routes(),
            &token_map(),
            2_000,
        )
        .unwrap();

        assert_eq!(forward.refunds, backward.refunds);
        assert_eq!(forward.lp_fees, backward.lp_fees);
        assert_eq!(forward.net_send_deltas(), backward.net_send_deltas());
    }
}
