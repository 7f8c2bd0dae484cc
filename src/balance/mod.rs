//! Simulated per-chain, per-token balance ledger
//!
//! Seeded from an on-chain snapshot at the start of an execution pass and
//! mutated locally as leaves are queued, so the lifecycle controller can
//! sequence executions without a chain round trip after every action. Owned
//! by exactly one pass; all mutation is synchronous through `&mut self`.

use ethers::types::{Address, U256};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct BalanceAllocator {
    balances: HashMap<(u64, Address), U256>,
}

impl BalanceAllocator {
    /// Create an allocator from a balance snapshot
    pub fn new(snapshot: HashMap<(u64, Address), U256>) -> Self {
        Self { balances: snapshot }
    }

    /// Current simulated balance for (chain, token)
    pub fn balance(&self, chain_id: u64, token: Address) -> U256 {
        self.balances
            .get(&(chain_id, token))
            .copied()
            .unwrap_or_default()
    }

    /// Debit `amount` if the simulated balance covers it. Returns whether the
    /// allocation succeeded; on failure the ledger is left unchanged.
    pub fn request_balance_allocation(
        &mut self,
        chain_id: u64,
        token: Address,
        amount: U256,
    ) -> bool {
        let entry = self.balances.entry((chain_id, token)).or_default();
        if amount > *entry {
            return false;
        }
        *entry -= amount;
        true
    }

    /// Credit an anticipated inflow, e.g. a bridge transfer queued earlier in
    /// the same pass that will land before dependent executions confirm
    pub fn add_credit(&mut self, chain_id: u64, token: Address, amount: U256) {
        let entry = self.balances.entry((chain_id, token)).or_default();
        *entry = entry.saturating_add(amount);
    }
}
