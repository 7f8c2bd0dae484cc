//! Error types for the Lattice dataworker

use thiserror::Error;

/// Main error type for the dataworker
#[derive(Error, Debug)]
pub enum DataworkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain_id} unavailable: {message}")]
    ChainUnavailable { chain_id: u64, message: String },

    #[error("Reorg suspected on chain {chain_id} near block {block_number}")]
    ReorgSuspected { chain_id: u64, block_number: u64 },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Event decoding error: {0}")]
    EventDecoding(String),

    #[error("Fill for deposit {deposit_id} on origin chain {origin_chain_id} matches no known deposit")]
    UnresolvedFill {
        origin_chain_id: u64,
        deposit_id: u32,
    },

    #[error("No L1 token mapping for token {token} on chain {chain_id}")]
    UnknownToken { chain_id: u64, token: String },

    #[error("Root mismatch for {root_kind} root: computed {computed}, expected {expected}")]
    RootMismatch {
        root_kind: String,
        computed: String,
        expected: String,
    },

    #[error("Bundle lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("Transaction reverted: {reason}")]
    Reverted { reason: String },

    #[error("Insufficient simulated balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Bridge error on chain {chain_id}: {message}")]
    Bridge { chain_id: u64, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataworkerError {
    /// Check if the operation can simply be retried on a later pass
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataworkerError::ChainUnavailable { .. }
                | DataworkerError::Timeout { .. }
                | DataworkerError::Reverted { .. }
                | DataworkerError::InsufficientBalance { .. }
        )
    }

    /// Check if the error invalidates the whole pass: nothing derived from the
    /// current event view may be written on-chain
    pub fn is_fatal_for_pass(&self) -> bool {
        matches!(
            self,
            DataworkerError::UnresolvedFill { .. }
                | DataworkerError::RootMismatch { .. }
                | DataworkerError::ReorgSuspected { .. }
        )
    }
}

/// Result type for dataworker operations
pub type DataworkerResult<T> = Result<T, DataworkerError>;
