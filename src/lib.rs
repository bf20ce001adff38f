// PolyDB - transactional polystore kernel
// Core library module

pub mod adapter;
pub mod algebra;
pub mod catalog;
pub mod common;
pub mod constraints;
pub mod error;
pub mod execution;
pub mod locking;
pub mod mvcc;
pub mod planner;
pub mod sequencer;
pub mod transaction;

pub use error::{DbError, Result};

use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use adapter::{Adapter, AdapterRegistry, MemoryAdapter};
use algebra::node::{AlgNode, AlgOperator, EntityRef};
use algebra::{rewrite_for_transaction, RowSet};
use catalog::Catalog;
use common::{DataModel, EntityId, EntityType, NamespaceId};
use constraints::UniqueConstraintEnforcer;
use locking::{DeadlockDetector, LockMode, Lockables};
use mvcc::MvccState;
use planner::{ConversionTarget, PlannerDriver};
use sequencer::Sequencer;
use transaction::{Transaction, TransactionFlavor, TransactionManager};

/// Kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Run the prepare phase across participants before committing.
    pub two_pc_mode: bool,
    /// Docker instances bindable by adapters deployed in docker mode.
    pub docker_instances: Vec<String>,
    /// Namespaces forced to MVCC semantics at startup, by id.
    pub mvcc_namespaces: HashSet<NamespaceId>,
    /// Namespace used when a transaction names none.
    pub default_namespace: NamespaceId,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            two_pc_mode: true,
            docker_instances: Vec::new(),
            mvcc_namespaces: HashSet::new(),
            default_namespace: 0,
        }
    }
}

/// Shared state threaded through transaction construction.
///
/// There are no process-wide singletons: every kernel owns its own context,
/// so tests run any number of isolated kernels side by side.
pub struct KernelContext {
    pub config: KernelConfig,
    pub sequencer: Arc<Sequencer>,
    pub mvcc: Arc<MvccState>,
    pub lockables: Arc<Lockables>,
    pub detector: Arc<DeadlockDetector>,
    pub catalog: Arc<Catalog>,
    pub adapters: Arc<AdapterRegistry>,
    /// Process epoch: the global half of every Xid this kernel issues.
    pub epoch: i64,
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// The assembled kernel: composition root over catalog, stores, locking,
/// versioning, and the transaction manager.
pub struct Kernel {
    context: Arc<KernelContext>,
    transactions: TransactionManager,
    planner: PlannerDriver,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Result<Self> {
        Self::with_catalog(config, Arc::new(Catalog::new()))
    }

    /// Builds a kernel over an existing (for example persisted) catalog and
    /// restores recorded adapter deployments.
    pub fn with_catalog(config: KernelConfig, catalog: Arc<Catalog>) -> Result<Self> {
        let mvcc = Arc::new(MvccState::new());
        let adapters = Arc::new(AdapterRegistry::new(Arc::clone(&catalog)));

        // The built-in memory store template.
        let factory_catalog = Arc::clone(&catalog);
        let factory_mvcc = Arc::clone(&mvcc);
        adapters.register(
            MemoryAdapter::descriptor().bind_docker_instances(&config.docker_instances),
            BTreeMap::new(),
            Box::new(move |id, unique_name, settings| {
                let adapter = match settings.get("model_support").map(String::as_str) {
                    Some("relational") => MemoryAdapter::relational_only(
                        id,
                        unique_name,
                        Arc::clone(&factory_catalog),
                        Arc::clone(&factory_mvcc),
                    ),
                    _ => MemoryAdapter::new(
                        id,
                        unique_name,
                        Arc::clone(&factory_catalog),
                        Arc::clone(&factory_mvcc),
                    ),
                };
                Ok(Arc::new(adapter))
            }),
        )?;

        for &namespace in &config.mvcc_namespaces {
            catalog.set_namespace_mvcc(namespace, true)?;
        }
        adapters.restore()?;

        let context = Arc::new(KernelContext {
            config,
            sequencer: Arc::new(Sequencer::new()),
            mvcc,
            lockables: Arc::new(Lockables::new()),
            detector: Arc::new(DeadlockDetector::new()),
            catalog,
            adapters,
            epoch: rand::rng().random_range(1..i64::MAX),
        });

        let transactions = TransactionManager::new(Arc::clone(&context));
        transactions.add_constraint_enforcer(Arc::new(UniqueConstraintEnforcer));

        Ok(Self {
            context,
            transactions,
            planner: PlannerDriver::new(),
        })
    }

    pub fn context(&self) -> &Arc<KernelContext> {
        &self.context
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.context.catalog
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.context.adapters
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin(&self, user: impl Into<String>) -> Arc<Transaction> {
        self.transactions.begin(
            user,
            self.context.config.default_namespace,
            TransactionFlavor::Interactive,
        )
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.transactions.commit(txn)
    }

    pub fn rollback(&self, txn: &Arc<Transaction>, reason: Option<&str>) {
        self.transactions.rollback(txn, reason)
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    pub fn create_namespace(
        &self,
        name: impl Into<String>,
        data_model: DataModel,
        mvcc: bool,
    ) -> Result<NamespaceId> {
        self.context.catalog.add_namespace(name, data_model, mvcc)
    }

    /// Creates an entity and places it on the named adapter.
    pub fn create_entity(
        &self,
        namespace: NamespaceId,
        name: impl Into<String>,
        data_model: DataModel,
        columns: Vec<String>,
        store: &str,
    ) -> Result<EntityId> {
        let adapter = self
            .context
            .adapters
            .get_by_unique_name(store)
            .ok_or_else(|| DbError::AdapterUnknown(store.to_string()))?;
        let entity_id = self.context.catalog.add_entity(
            namespace,
            name,
            data_model,
            EntityType::Entity,
            columns,
        )?;
        let snapshot = self.context.catalog.snapshot();
        let entity = snapshot
            .entity(entity_id)
            .ok_or_else(|| DbError::internal("entity vanished right after creation"))?;
        match data_model {
            DataModel::Relational => adapter.create_table(entity)?,
            DataModel::Document => adapter.create_collection(entity)?,
            DataModel::Graph => adapter.create_graph(entity)?,
        }
        self.context.catalog.add_placement(entity_id, adapter.id())?;
        Ok(entity_id)
    }

    pub fn drop_entity(&self, entity_id: EntityId) -> Result<()> {
        let snapshot = self.context.catalog.snapshot();
        let entity = snapshot
            .entity(entity_id)
            .ok_or_else(|| DbError::Catalog(format!("entity {} not found", entity_id)))?
            .clone();
        for placement in snapshot.placements_of(entity_id) {
            if let Some(adapter) = self.context.adapters.get(placement.adapter) {
                match entity.data_model {
                    DataModel::Relational => adapter.drop_table(&entity)?,
                    DataModel::Document => adapter.drop_collection(&entity)?,
                    DataModel::Graph => adapter.drop_graph(&entity)?,
                }
            }
        }
        self.context.catalog.drop_entity(entity_id)?;
        self.context.mvcc.forget(entity_id);
        self.context.lockables.forget_entity(entity_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Runs one algebra statement under `txn`: MVCC rewrite, lock
    /// acquisition, per-adapter planning, and execution.
    pub fn run(&self, txn: &Arc<Transaction>, plan: &Arc<AlgNode>) -> Result<RowSet> {
        if !txn.is_active() {
            return Err(transaction::TransactionError::not_active(txn.id(), txn.state()).into());
        }
        // Cooperative cancellation point for statements that never block.
        if txn.is_interrupted() {
            return Err(DbError::Deadlock { victim: txn.id() });
        }
        let snapshot = self.context.catalog.snapshot();
        let rewritten = rewrite_for_transaction(txn, &snapshot, plan)?;

        self.acquire_statement_locks(txn, &rewritten, &snapshot)?;

        let adapter = self.statement_adapter(&rewritten, &snapshot)?;
        let target = ConversionTarget {
            adapter: adapter.id(),
            capabilities: adapter.capabilities(),
        };
        let physical = self.planner.convert_for_adapter(&rewritten, &target)?;
        txn.record_adapter(adapter.id());
        adapter.execute(&physical, txn)
    }

    /// Writes lock their entity exclusively; reads of unversioned entities
    /// take a shared lock. Snapshot reads of MVCC entities stay lock-free.
    fn acquire_statement_locks(
        &self,
        txn: &Arc<Transaction>,
        plan: &Arc<AlgNode>,
        snapshot: &catalog::CatalogSnapshot,
    ) -> Result<()> {
        let mut targets: Vec<(EntityRef, LockMode)> = Vec::new();
        collect_lock_targets(plan, snapshot, &mut targets);
        for (entity, mode) in targets {
            let lockable = self
                .context
                .lockables
                .entity(entity.namespace, entity.id);
            txn.acquire(lockable, mode, &self.context.detector)?;
        }
        Ok(())
    }

    fn statement_adapter(
        &self,
        plan: &Arc<AlgNode>,
        snapshot: &catalog::CatalogSnapshot,
    ) -> Result<Arc<dyn Adapter>> {
        let mut entities = Vec::new();
        collect_catalog_entities(plan, snapshot, &mut entities);
        let first = entities.first().ok_or_else(|| {
            DbError::Execution("statement references no stored entity".into())
        })?;
        let placement = snapshot
            .placements_of(*first)
            .into_iter()
            .next()
            .ok_or_else(|| {
                DbError::Execution(format!("entity {} has no placement", first))
            })?;
        let adapter_id = placement.adapter;
        for entity in &entities {
            let placed = snapshot
                .placements_of(*entity)
                .iter()
                .any(|p| p.adapter == adapter_id);
            if !placed {
                return Err(DbError::Execution(
                    "statement spans adapters; cross-store execution is delegated to the planner host"
                        .into(),
                ));
            }
        }
        self.context
            .adapters
            .get(adapter_id)
            .ok_or_else(|| DbError::AdapterUnknown(format!("adapter id {}", adapter_id)))
    }
}

fn collect_lock_targets(
    plan: &Arc<AlgNode>,
    snapshot: &catalog::CatalogSnapshot,
    targets: &mut Vec<(EntityRef, LockMode)>,
) {
    match plan.op() {
        AlgOperator::Modify { entity, .. } => {
            targets.push((entity.clone(), LockMode::Exclusive));
        }
        AlgOperator::Scan { entity, .. } => {
            if snapshot.entity(entity.id).is_some() && !snapshot.is_mvcc(entity.id) {
                targets.push((entity.clone(), LockMode::Shared));
            }
        }
        _ => {}
    }
    for input in plan.inputs() {
        collect_lock_targets(input, snapshot, targets);
    }
}

fn collect_catalog_entities(
    plan: &Arc<AlgNode>,
    snapshot: &catalog::CatalogSnapshot,
    entities: &mut Vec<EntityId>,
) {
    match plan.op() {
        AlgOperator::Scan { entity, .. }
        | AlgOperator::Modify { entity, .. }
        | AlgOperator::Identifier { entity } => {
            if snapshot.entity(entity.id).is_some() && !entities.contains(&entity.id) {
                entities.push(entity.id);
            }
        }
        _ => {}
    }
    for input in plan.inputs() {
        collect_catalog_entities(input, snapshot, entities);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_bootstrap() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel
            .adapters()
            .deploy("memory", "hot", BTreeMap::new())
            .unwrap();
        let ns = kernel
            .create_namespace("public", DataModel::Relational, true)
            .unwrap();
        let table = kernel
            .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
            .unwrap();
        assert!(kernel.catalog().snapshot().is_mvcc(table));
    }

    #[test]
    fn test_isolated_kernels() {
        let a = Kernel::new(KernelConfig::default()).unwrap();
        let b = Kernel::new(KernelConfig::default()).unwrap();
        let t1 = a.begin("alice");
        let t2 = b.begin("bob");
        // Separate sequencers issue overlapping tickets; the xid epochs
        // disambiguate.
        assert_eq!(t1.id(), t2.id());
        assert_ne!(t1.xid(), t2.xid());
    }
}
