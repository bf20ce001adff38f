// Transaction subsystem: lifecycle, versioned identity, and the commit
// pipeline over heterogeneous participants.

pub mod error;
pub mod manager;
pub mod types;

pub use error::{TransactionError, TransactionResult};
pub use manager::{
    ConservativeValidator, ConstraintEnforcer, OptimisticValidator, TransactionManager,
    TransactionStatistics, WriteSetValidator,
};
pub use types::{Transaction, TransactionFlavor, TransactionState, Xid};
