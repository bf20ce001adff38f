use thiserror::Error;

use crate::common::TransactionId;

pub type Result<T> = std::result::Result<T, DbError>;

/// Kernel-wide error type.
///
/// The first block mirrors the errors a client of the kernel can observe;
/// the second covers the ambient subsystems. Only `IllegalField`, `Conflict`,
/// `ConstraintViolation`, and `Deadlock` are recoverable by the client.
#[derive(Error, Debug)]
pub enum DbError {
    /// User statement wrote a reserved field (`_eid` / `_vid`).
    #[error("Illegal field '{field}': reserved for internal versioning")]
    IllegalField { field: String },

    /// The deadlock detector selected this transaction as victim.
    #[error("Deadlock detected: transaction {victim} selected as victim")]
    Deadlock { victim: TransactionId },

    /// Write-set validation failed at commit.
    #[error("Write conflict: transaction {txn_id} lost entity {entity_id} to commit instant {instant}")]
    Conflict {
        txn_id: TransactionId,
        entity_id: u64,
        instant: i64,
    },

    /// ON_COMMIT constraint enforcement reported a violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A two-phase-commit participant voted no.
    #[error("Prepare failed: adapter '{adapter}' refused to prepare transaction {txn_id}")]
    PrepareFailed {
        adapter: String,
        txn_id: TransactionId,
    },

    /// No adapter template or instance under the given name.
    #[error("Unknown adapter: {0}")]
    AdapterUnknown(String),

    /// Adapter removal refused while allocations still target it.
    #[error("Adapter '{unique_name}' is in use by {allocations} allocation(s)")]
    AdapterInUse {
        unique_name: String,
        allocations: usize,
    },

    /// Deploy-time unique-name collision.
    #[error("Adapter unique name '{0}' already taken")]
    DuplicateUniqueName(String),

    /// Invariant violation inside the kernel. Not recoverable.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Transaction error: {0}")]
    Transaction(crate::transaction::TransactionError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Algebra error: {0}")]
    Algebra(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    pub fn illegal_field(field: impl Into<String>) -> Self {
        DbError::IllegalField {
            field: field.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DbError::Internal(message.into())
    }

    /// True when the client caused the failure and can fix or retry it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DbError::IllegalField { .. }
                | DbError::Conflict { .. }
                | DbError::ConstraintViolation(_)
                | DbError::Deadlock { .. }
        )
    }

    /// True when simply re-running the transaction is a sensible reaction.
    pub fn retry_advisable(&self) -> bool {
        matches!(self, DbError::Deadlock { .. } | DbError::Conflict { .. })
    }
}

/// Lock-manager deadlocks surface as the client-visible `Deadlock` kind;
/// every other transaction error keeps its own variant.
impl From<crate::transaction::TransactionError> for DbError {
    fn from(err: crate::transaction::TransactionError) -> Self {
        match err {
            crate::transaction::TransactionError::Deadlock { victim } => {
                DbError::Deadlock { victim }
            }
            other => DbError::Transaction(other),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(DbError::illegal_field("_vid").is_recoverable());
        assert!(DbError::Deadlock { victim: 7 }.is_recoverable());
        assert!(!DbError::internal("pending modifications left").is_recoverable());
        assert!(!DbError::AdapterUnknown("mongo".into()).is_recoverable());
    }

    #[test]
    fn test_retry_advice() {
        assert!(DbError::Conflict {
            txn_id: 1,
            entity_id: 2,
            instant: 3
        }
        .retry_advisable());
        assert!(!DbError::ConstraintViolation("pk".into()).retry_advisable());
    }
}
