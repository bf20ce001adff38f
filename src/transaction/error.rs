//! Transaction-specific error types.

use thiserror::Error;

use crate::common::TransactionId;

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Errors raised by the transaction lifecycle and the lock manager.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The deadlock detector selected this transaction as victim, or a
    /// client-initiated cancel interrupted its wait.
    #[error("Deadlock: transaction {victim} selected as victim")]
    Deadlock { victim: TransactionId },

    /// Operation on a transaction that is no longer active.
    #[error("Transaction {txn_id} is not active (state: {state})")]
    NotActive { txn_id: TransactionId, state: String },

    /// Transaction id unknown to the manager.
    #[error("Transaction {0} not found")]
    NotFound(TransactionId),

    /// Invariant violation inside the transaction subsystem.
    #[error("Internal transaction error for {txn_id}: {message}")]
    Internal {
        txn_id: TransactionId,
        message: String,
    },
}

impl TransactionError {
    pub fn deadlock(victim: TransactionId) -> Self {
        TransactionError::Deadlock { victim }
    }

    pub fn not_active(txn_id: TransactionId, state: impl std::fmt::Display) -> Self {
        TransactionError::NotActive {
            txn_id,
            state: state.to_string(),
        }
    }

    pub fn internal(txn_id: TransactionId, message: impl Into<String>) -> Self {
        TransactionError::Internal {
            txn_id,
            message: message.into(),
        }
    }

    /// Deadlocks are worth retrying; the rest are usage errors.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransactionError::Deadlock { .. })
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            TransactionError::Deadlock { victim } => Some(*victim),
            TransactionError::NotActive { txn_id, .. } => Some(*txn_id),
            TransactionError::NotFound(id) => Some(*id),
            TransactionError::Internal { txn_id, .. } => Some(*txn_id),
        }
    }
}
