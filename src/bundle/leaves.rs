//! Leaf construction for the three bundle Merkle trees
//!
//! Partitions the settlement ledger into pool rebalance, relayer refund and
//! slow relay leaves, enforcing the hub contract's per-leaf caps, and commits
//! each set to a Merkle root with per-leaf inclusion proofs. Leaf encoding is
//! canonical: field order is fixed, integers are big-endian, vectors are
//! length-prefixed, and each leaf type carries a distinct domain tag, so an
//! identical ledger always commits to bit-identical roots.

use crate::bundle::reconciler::SettlementLedger;
use crate::config::BundleConfig;
use crate::merkle;

use ethers::types::{Address, I256, U256};
use std::collections::BTreeMap;

/// Net L1-token flows between the hub and one spoke. One chain's tokens may
/// split across several leaves; `group_index` orders the continuation leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRebalanceLeaf {
    pub leaf_id: u32,
    pub chain_id: u64,
    pub group_index: u32,
    pub l1_tokens: Vec<Address>,
    /// Positive: hub sends to the spoke. Negative: the spoke returns funds
    /// through its relayer refund leaf's amount_to_return.
    pub net_send_amounts: Vec<I256>,
    pub running_balances: Vec<I256>,
    pub bundle_lp_fees: Vec<U256>,
}

/// Per-chain, per-token relayer payouts, size-capped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerRefundLeaf {
    pub leaf_id: u32,
    pub chain_id: u64,
    pub l1_token: Address,
    /// Portion the spoke returns to the hub over its native bridge; set on
    /// the first leaf of a (chain, token) group only
    pub amount_to_return: U256,
    pub refund_addresses: Vec<Address>,
    pub refund_amounts: Vec<U256>,
}

/// Zero-fee completion entry for one deposit's unfilled remainder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowRelayLeaf {
    pub leaf_id: u32,
    pub origin_chain_id: u64,
    pub deposit_id: u32,
    pub destination_chain_id: u64,
    pub recipient: Address,
    pub l1_token: Address,
    pub amount: U256,
}

fn put_u256(out: &mut Vec<u8>, value: U256) {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    out.extend_from_slice(&buf);
}

fn put_i256(out: &mut Vec<u8>, value: I256) {
    put_u256(out, value.into_raw());
}

impl PoolRebalanceLeaf {
    pub fn hash(&self) -> [u8; 32] {
        let mut out = vec![0x01u8];
        out.extend_from_slice(&(self.leaf_id).to_be_bytes());
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out.extend_from_slice(&self.group_index.to_be_bytes());
        out.extend_from_slice(&(self.l1_tokens.len() as u32).to_be_bytes());
        for token in &self.l1_tokens {
            out.extend_from_slice(token.as_bytes());
        }
        for amount in &self.net_send_amounts {
            put_i256(&mut out, *amount);
        }
        for balance in &self.running_balances {
            put_i256(&mut out, *balance);
        }
        for fee in &self.bundle_lp_fees {
            put_u256(&mut out, *fee);
        }
        merkle::keccak256(&out)
    }
}

impl RelayerRefundLeaf {
    pub fn hash(&self) -> [u8; 32] {
        let mut out = vec![0x02u8];
        out.extend_from_slice(&self.leaf_id.to_be_bytes());
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out.extend_from_slice(self.l1_token.as_bytes());
        put_u256(&mut out, self.amount_to_return);
        out.extend_from_slice(&(self.refund_addresses.len() as u32).to_be_bytes());
        for address in &self.refund_addresses {
            out.extend_from_slice(address.as_bytes());
        }
        for amount in &self.refund_amounts {
            put_u256(&mut out, *amount);
        }
        merkle::keccak256(&out)
    }
}

impl SlowRelayLeaf {
    pub fn hash(&self) -> [u8; 32] {
        let mut out = vec![0x03u8];
        out.extend_from_slice(&self.leaf_id.to_be_bytes());
        out.extend_from_slice(&self.origin_chain_id.to_be_bytes());
        out.extend_from_slice(&self.deposit_id.to_be_bytes());
        out.extend_from_slice(&self.destination_chain_id.to_be_bytes());
        out.extend_from_slice(self.recipient.as_bytes());
        out.extend_from_slice(self.l1_token.as_bytes());
        put_u256(&mut out, self.amount);
        merkle::keccak256(&out)
    }
}

/// One committed leaf set: leaves in leaf-id order, the root, and the
/// inclusion proof for each leaf
#[derive(Debug, Clone)]
pub struct LeafSet<L> {
    pub leaves: Vec<L>,
    pub root: [u8; 32],
    pub proofs: Vec<Vec<[u8; 32]>>,
}

impl<L> Default for LeafSet<L> {
    fn default() -> Self {
        Self {
            leaves: Vec::new(),
            root: [0u8; 32],
            proofs: Vec::new(),
        }
    }
}

fn commit<L>(leaves: Vec<L>, hash: impl Fn(&L) -> [u8; 32]) -> LeafSet<L> {
    let hashes: Vec<[u8; 32]> = leaves.iter().map(&hash).collect();
    let root = merkle::build_root(&hashes);
    let proofs = (0..hashes.len())
        .map(|i| merkle::build_proof(&hashes, i))
        .collect();
    LeafSet {
        leaves,
        root,
        proofs,
    }
}

/// The three committed trees of one root bundle
#[derive(Debug, Clone, Default)]
pub struct BundleRoots {
    pub pool_rebalance: LeafSet<PoolRebalanceLeaf>,
    pub relayer_refund: LeafSet<RelayerRefundLeaf>,
    pub slow_relay: LeafSet<SlowRelayLeaf>,
}

impl BundleRoots {
    /// Amount each spoke returns to the hub, summed over its refund leaves
    pub fn amount_to_return(&self, chain_id: u64, l1_token: Address) -> U256 {
        self.relayer_refund
            .leaves
            .iter()
            .filter(|l| l.chain_id == chain_id && l.l1_token == l1_token)
            .fold(U256::zero(), |acc, l| acc.saturating_add(l.amount_to_return))
    }
}

/// Build all three leaf sets from a reconciled ledger
pub fn build_bundle(ledger: &SettlementLedger, caps: &BundleConfig) -> BundleRoots {
    let deltas = ledger.net_send_deltas();

    // Per-chain token rows for pool rebalance leaves: union of net sends and
    // LP fee accruals, keyed canonically by (chain, token)
    let mut rows: BTreeMap<(u64, Address), (I256, U256)> = BTreeMap::new();
    for (key, delta) in &deltas {
        rows.entry(*key).or_insert((I256::zero(), U256::zero())).0 = *delta;
    }
    for (key, fee) in &ledger.lp_fees {
        rows.entry(*key).or_insert((I256::zero(), U256::zero())).1 = *fee;
    }

    // Pool rebalance leaves: per chain, token-sorted, cap-split with
    // group_index numbering the chunks
    let mut by_chain: BTreeMap<u64, Vec<(Address, I256, U256)>> = BTreeMap::new();
    for ((chain_id, token), (delta, fee)) in rows {
        by_chain
            .entry(chain_id)
            .or_default()
            .push((token, delta, fee));
    }

    let mut pool_leaves = Vec::new();
    let mut leaf_id: u32 = 0;
    for (chain_id, tokens) in &by_chain {
        for (group_index, chunk) in tokens
            .chunks(caps.max_l1_tokens_per_pool_rebalance_leaf)
            .enumerate()
        {
            pool_leaves.push(PoolRebalanceLeaf {
                leaf_id,
                chain_id: *chain_id,
                group_index: group_index as u32,
                l1_tokens: chunk.iter().map(|(t, _, _)| *t).collect(),
                net_send_amounts: chunk.iter().map(|(_, d, _)| *d).collect(),
                // Full-transfer policy: every bundle settles its whole delta,
                // leaving nothing carried on the running balance
                running_balances: vec![I256::zero(); chunk.len()],
                bundle_lp_fees: chunk.iter().map(|(_, _, f)| *f).collect(),
            });
            leaf_id += 1;
        }
    }

    // Relayer refund leaves: refunds grouped by (chain, token), entries
    // ordered by amount descending then address, cap-split. A (chain, token)
    // with a negative net send but no refunds still gets a leaf to carry the
    // return-to-hub amount.
    let mut refund_groups: BTreeMap<(u64, Address), Vec<(Address, U256)>> = BTreeMap::new();
    for ((chain_id, token, relayer), amount) in &ledger.refunds {
        refund_groups
            .entry((*chain_id, *token))
            .or_default()
            .push((*relayer, *amount));
    }
    for (key, delta) in &deltas {
        if delta.is_negative() {
            refund_groups.entry(*key).or_default();
        }
    }

    let mut refund_leaves = Vec::new();
    let mut leaf_id: u32 = 0;
    for ((chain_id, token), mut entries) in refund_groups {
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let amount_to_return = deltas
            .get(&(chain_id, token))
            .filter(|d| d.is_negative())
            .map(|d| d.unsigned_abs())
            .unwrap_or_default();

        if entries.is_empty() {
            refund_leaves.push(RelayerRefundLeaf {
                leaf_id,
                chain_id,
                l1_token: token,
                amount_to_return,
                refund_addresses: Vec::new(),
                refund_amounts: Vec::new(),
            });
            leaf_id += 1;
            continue;
        }

        for (chunk_index, chunk) in entries
            .chunks(caps.max_refunds_per_relayer_refund_leaf)
            .enumerate()
        {
            refund_leaves.push(RelayerRefundLeaf {
                leaf_id,
                chain_id,
                l1_token: token,
                amount_to_return: if chunk_index == 0 {
                    amount_to_return
                } else {
                    U256::zero()
                },
                refund_addresses: chunk.iter().map(|(a, _)| *a).collect(),
                refund_amounts: chunk.iter().map(|(_, v)| *v).collect(),
            });
            leaf_id += 1;
        }
    }

    // Slow relay leaves, already ordered by (origin chain, deposit id)
    let slow_leaves = ledger
        .slow_relays
        .iter()
        .enumerate()
        .map(|(i, relay)| SlowRelayLeaf {
            leaf_id: i as u32,
            origin_chain_id: relay.deposit.origin_chain_id,
            deposit_id: relay.deposit.deposit_id,
            destination_chain_id: relay.deposit.destination_chain_id,
            recipient: relay.deposit.recipient,
            l1_token: relay.l1_token,
            amount: relay.amount,
        })
        .collect();

    BundleRoots {
        pool_rebalance: commit(pool_leaves, PoolRebalanceLeaf::hash),
        relayer_refund: commit(refund_leaves, RelayerRefundLeaf::hash),
        slow_relay: commit(slow_leaves, SlowRelayLeaf::hash),
    }
}
