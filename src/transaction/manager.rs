// Transaction lifecycle coordination.
//
// The manager owns the active-transaction table and the commit pipeline.
// Begin and commit-publication share one critical section: a snapshot is
// never drawn while another transaction is between drawing its commit
// instant and registering it on every written entity. Together with the
// exclusive locks writers hold until the end of commit, that is what makes
// commit atomicity observable: a reader either predates the instant or
// sees every entity's log entry.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::common::{NamespaceId, TransactionId};
use crate::error::{DbError, Result};
use crate::KernelContext;

use super::error::TransactionError;
use super::types::{Transaction, TransactionFlavor, TransactionState, Xid};

/// Write-set validation hook, run first in the commit pipeline.
///
/// The default is optimistic first-committer-wins at entity granularity.
/// Embedders that prefer pure lock-based protection can install
/// [`ConservativeValidator`], which always passes.
pub trait WriteSetValidator: Send + Sync {
    fn validate(&self, context: &KernelContext, txn: &Transaction) -> Result<()>;
}

/// Rejects the commit if any written entity has a committed instant newer
/// than the transaction's snapshot.
pub struct OptimisticValidator;

impl WriteSetValidator for OptimisticValidator {
    fn validate(&self, context: &KernelContext, txn: &Transaction) -> Result<()> {
        for entity in txn.written_entities() {
            let log = context.mvcc.commit_log(entity);
            let max = log.max_instant();
            if max > txn.snapshot() {
                return Err(DbError::Conflict {
                    txn_id: txn.id(),
                    entity_id: entity,
                    instant: max,
                });
            }
        }
        Ok(())
    }
}

/// Always passes; exclusive locks are the only write protection.
pub struct ConservativeValidator;

impl WriteSetValidator for ConservativeValidator {
    fn validate(&self, _context: &KernelContext, _txn: &Transaction) -> Result<()> {
        Ok(())
    }
}

/// ON_COMMIT constraint enforcement hook. Returns violation messages; any
/// non-empty result aborts the commit with the first message.
pub trait ConstraintEnforcer: Send + Sync {
    fn enforce(&self, context: &KernelContext, txn: &Transaction) -> Result<Vec<String>>;
}

/// Monitoring counters, updated on every lifecycle event.
#[derive(Debug, Default)]
pub struct TransactionStatistics {
    pub begun: AtomicU64,
    pub committed: AtomicU64,
    pub rolled_back: AtomicU64,
    pub deadlock_victims: AtomicU64,
}

impl TransactionStatistics {
    pub fn summary(&self) -> (u64, u64, u64, u64) {
        (
            self.begun.load(Ordering::Relaxed),
            self.committed.load(Ordering::Relaxed),
            self.rolled_back.load(Ordering::Relaxed),
            self.deadlock_victims.load(Ordering::Relaxed),
        )
    }
}

/// Transaction lifecycle manager.
pub struct TransactionManager {
    context: Arc<KernelContext>,
    active: RwLock<HashMap<TransactionId, Arc<Transaction>>>,
    /// Serializes snapshot draws with commit-instant publication.
    sequence_guard: Mutex<()>,
    validator: RwLock<Arc<dyn WriteSetValidator>>,
    enforcers: RwLock<Vec<Arc<dyn ConstraintEnforcer>>>,
    statistics: TransactionStatistics,
}

impl TransactionManager {
    pub fn new(context: Arc<KernelContext>) -> Self {
        Self {
            context,
            active: RwLock::new(HashMap::new()),
            sequence_guard: Mutex::new(()),
            validator: RwLock::new(Arc::new(OptimisticValidator)),
            enforcers: RwLock::new(Vec::new()),
            statistics: TransactionStatistics::default(),
        }
    }

    pub fn context(&self) -> &Arc<KernelContext> {
        &self.context
    }

    /// Swaps the write-set validation strategy.
    pub fn set_write_set_validator(&self, validator: Arc<dyn WriteSetValidator>) {
        *self.validator.write() = validator;
    }

    /// Registers an ON_COMMIT enforcement hook.
    pub fn add_constraint_enforcer(&self, enforcer: Arc<dyn ConstraintEnforcer>) {
        self.enforcers.write().push(enforcer);
    }

    /// Begins a transaction for `user` against `namespace`.
    ///
    /// One sequencer ticket serves as both id and snapshot; commit instants
    /// come from the same sequence, so snapshot comparisons are total.
    pub fn begin(
        &self,
        user: impl Into<String>,
        namespace: NamespaceId,
        flavor: TransactionFlavor,
    ) -> Arc<Transaction> {
        let ticket = {
            let _guard = self.sequence_guard.lock();
            self.context.sequencer.next()
        };
        let xid = Xid::new(self.context.epoch, ticket);
        let txn = Arc::new(Transaction::new(
            ticket,
            ticket,
            xid,
            user,
            namespace,
            flavor,
        ));
        self.active.write().insert(ticket, Arc::clone(&txn));
        self.statistics.begun.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(txn = ticket, user = txn.user(), "transaction begun");
        txn
    }

    pub fn get(&self, txn_id: TransactionId) -> Option<Arc<Transaction>> {
        self.active.read().get(&txn_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn statistics(&self) -> &TransactionStatistics {
        &self.statistics
    }

    /// Commits `txn`, running the full pipeline. Any failure triggers a
    /// rollback before the error surfaces; no partial commit is ever
    /// observable.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        if !txn.transition(TransactionState::Active, TransactionState::Committing) {
            return Err(
                TransactionError::not_active(txn.id(), txn.state()).into(),
            );
        }

        match self.commit_pipeline(txn) {
            Ok(()) => {
                self.finish(txn, TransactionState::Committed);
                self.statistics.committed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(txn = txn.id(), "transaction committed");
                Ok(())
            }
            Err(error) => {
                if matches!(error, DbError::Deadlock { .. }) {
                    self.statistics
                        .deadlock_victims
                        .fetch_add(1, Ordering::Relaxed);
                }
                txn.force_state(TransactionState::Active);
                self.rollback(txn, Some(&error.to_string()));
                Err(error)
            }
        }
    }

    fn commit_pipeline(&self, txn: &Arc<Transaction>) -> Result<()> {
        // 1. Write-set validation.
        self.validator.read().validate(&self.context, txn)?;

        // 2. Catalog integrity: every written entity must still exist and
        //    accept modification.
        let snapshot = self.context.catalog.snapshot();
        for entity_id in txn.written_entities() {
            let entity = snapshot.entity(entity_id).ok_or_else(|| {
                DbError::Catalog(format!(
                    "written entity {} vanished before commit",
                    entity_id
                ))
            })?;
            if !entity.is_modifiable() {
                return Err(DbError::Catalog(format!(
                    "entity '{}' is not modifiable",
                    entity.name
                )));
            }
        }

        let participants = self.participants(txn)?;

        // 3. Two-phase commit: every participant must vote yes.
        if self.context.config.two_pc_mode {
            for adapter in &participants {
                let prepared = adapter.prepare(&txn.xid())?;
                if !prepared {
                    return Err(DbError::PrepareFailed {
                        adapter: adapter.unique_name().to_string(),
                        txn_id: txn.id(),
                    });
                }
            }
        }

        // 4. ON_COMMIT constraint enforcement.
        for enforcer in self.enforcers.read().iter() {
            let violations = enforcer.enforce(&self.context, txn)?;
            if let Some(first) = violations.into_iter().next() {
                return Err(DbError::ConstraintViolation(first));
            }
        }

        // 5. Publish: draw the instant and register it on every written
        //    entity inside the critical section shared with begin().
        {
            let _guard = self.sequence_guard.lock();
            let instant = self.context.sequencer.next();
            for entity_id in txn.written_entities() {
                self.context
                    .mvcc
                    .commit_log(entity_id)
                    .register(txn.id(), instant);
            }
            tracing::debug!(txn = txn.id(), instant, "commit instant published");
        }

        // 6. Let every participant flip its staged versions.
        for adapter in &participants {
            adapter.commit(&txn.xid())?;
        }

        Ok(())
    }

    /// Rolls back `txn`. Safe to call at any point and idempotent; a
    /// transaction that already reached a terminal state is left alone.
    pub fn rollback(&self, txn: &Arc<Transaction>, reason: Option<&str>) {
        if !txn.transition(TransactionState::Active, TransactionState::RollingBack) {
            return;
        }
        if let Some(reason) = reason {
            tracing::info!(txn = txn.id(), reason, "rolling back");
        }

        match self.participants(txn) {
            Ok(participants) => {
                for adapter in &participants {
                    if let Err(error) = adapter.rollback(&txn.xid()) {
                        tracing::warn!(
                            txn = txn.id(),
                            adapter = adapter.unique_name(),
                            %error,
                            "participant rollback failed"
                        );
                    }
                }
            }
            Err(error) => {
                tracing::warn!(txn = txn.id(), %error, "participant lookup failed during rollback");
            }
        }

        self.finish(txn, TransactionState::RolledBack);
        self.statistics.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Client-initiated cancellation: raises the flag and interrupts the
    /// current lock wait, if any. In-flight adapter calls observe the flag
    /// cooperatively.
    pub fn cancel(&self, txn_id: TransactionId) {
        if let Some(txn) = self.get(txn_id) {
            txn.mark_interrupted();
            self.context.detector.interrupt_waiter(txn_id);
            tracing::debug!(txn = txn_id, "cancel requested");
        }
    }

    fn participants(&self, txn: &Arc<Transaction>) -> Result<Vec<Arc<dyn Adapter>>> {
        txn.touched_adapters()
            .into_iter()
            .map(|id| {
                self.context
                    .adapters
                    .get(id)
                    .ok_or_else(|| DbError::AdapterUnknown(format!("adapter id {}", id)))
            })
            .collect()
    }

    fn finish(&self, txn: &Arc<Transaction>, state: TransactionState) {
        txn.release_all_locks(&self.context.detector);
        self.context.detector.transaction_done(txn.id());
        txn.force_state(state);
        self.active.write().remove(&txn.id());
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.active_count())
            .finish()
    }
}
