// End-to-end scenarios against assembled kernels: snapshot visibility,
// identifier stability, deadlock victimization, writer fairness, reserved
// fields, and two-phase commit aborts. Each test builds its own isolated
// kernel with in-memory stores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use polydb::adapter::{
    Adapter, AdapterCapabilities, AdapterDescriptor, AdapterKind, DeployMode, MemoryAdapter,
};
use polydb::algebra::{
    AlgBuilder, AlgField, AlgNode, AlgRowType, EntityRef, MatchKind, ModifyOperation, PolyType,
    RexNode, RowSet,
};
use polydb::catalog::ConstraintKind;
use polydb::common::{DataModel, PolyValue};
use polydb::locking::LockMode;
use polydb::transaction::Transaction;
use polydb::{DbError, Kernel, KernelConfig};

// ============================================================================
// Fixture helpers
// ============================================================================

fn kernel() -> Kernel {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();
    kernel
        .adapters()
        .deploy("memory", "hot", BTreeMap::new())
        .unwrap();
    kernel
}

fn entity_ref(kernel: &Kernel, id: u64) -> EntityRef {
    let snapshot = kernel.catalog().snapshot();
    let entity = snapshot.entity(id).unwrap();
    EntityRef {
        id: entity.id,
        namespace: entity.namespace,
        name: entity.name.clone(),
    }
}

fn insert_plan(kernel: &Kernel, table: u64, x: i64) -> Arc<AlgNode> {
    AlgBuilder::logical()
        .values(
            AlgRowType::new(vec![AlgField::new("x", PolyType::Integer)]),
            vec![vec![PolyValue::Integer(x)]],
        )
        .modify(
            entity_ref(kernel, table),
            ModifyOperation::Insert,
            vec![],
            vec![],
        )
        .unwrap()
        .build()
        .unwrap()
}

fn scan_plan(kernel: &Kernel, table: u64) -> Arc<AlgNode> {
    let snapshot = kernel.catalog().snapshot();
    let entity = snapshot.entity(table).unwrap();
    let row_type = match entity.data_model {
        DataModel::Relational => {
            AlgRowType::versioned_relational(entity.columns.iter().map(String::as_str))
        }
        DataModel::Document => AlgRowType::versioned_document(),
        DataModel::Graph => AlgRowType::versioned_graph(),
    };
    AlgBuilder::logical()
        .scan(entity.data_model, entity_ref(kernel, table), row_type)
        .build()
        .unwrap()
}

fn scan(kernel: &Kernel, txn: &Arc<Transaction>, table: u64) -> RowSet {
    kernel.run(txn, &scan_plan(kernel, table)).unwrap()
}

fn is_deadlock(error: &DbError) -> bool {
    matches!(error, DbError::Deadlock { .. })
}

// ============================================================================
// S1 - Snapshot blinds late readers
// ============================================================================

#[test]
fn snapshot_blinds_late_readers() {
    let kernel = kernel();
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let table = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();

    let t1 = kernel.begin("alice");
    kernel.run(&t1, &insert_plan(&kernel, table, 1)).unwrap();
    kernel.commit(&t1).unwrap();
    let c1 = kernel
        .context()
        .mvcc
        .commit_log(table)
        .instant_of(t1.id())
        .unwrap();

    let t2 = kernel.begin("bob");
    assert!(t2.snapshot() > c1);
    kernel.run(&t2, &insert_plan(&kernel, table, 2)).unwrap();

    // T3 begins after T2's insert but before T2 commits.
    let t3 = kernel.begin("carol");
    assert!(t3.snapshot() > c1);
    let result = scan(&kernel, &t3, table);
    assert_eq!(result.len(), 1, "T3 must see exactly T1's row");
    assert_eq!(result.rows[0][2], PolyValue::Integer(1));

    // T2 itself reads its own staged row next to the committed one.
    let own = scan(&kernel, &t2, table);
    assert_eq!(own.len(), 2, "read-own-writes");

    kernel.commit(&t2).unwrap();

    // T3's snapshot still predates T2's commit instant.
    let after = scan(&kernel, &t3, table);
    assert_eq!(after.len(), 1);
    kernel.commit(&t3).unwrap();

    // A fresh reader sees both rows.
    let t4 = kernel.begin("dave");
    assert_eq!(scan(&kernel, &t4, table).len(), 2);
}

// ============================================================================
// S2 - Update preserves _eid
// ============================================================================

#[test]
fn update_preserves_entry_identifier() {
    let kernel = kernel();
    let ns = kernel
        .create_namespace("docs", DataModel::Document, true)
        .unwrap();
    let coll = kernel
        .create_entity(ns, "people", DataModel::Document, vec!["d".into()], "hot")
        .unwrap();

    let t1 = kernel.begin("alice");
    let insert = AlgBuilder::logical()
        .document_values(vec![PolyValue::document([("a", PolyValue::Integer(1))])])
        .modify(
            entity_ref(&kernel, coll),
            ModifyOperation::Insert,
            vec![],
            vec![],
        )
        .unwrap()
        .build()
        .unwrap();
    kernel.run(&t1, &insert).unwrap();
    kernel.commit(&t1).unwrap();

    let reader = kernel.begin("bob");
    let before = scan(&kernel, &reader, coll);
    assert_eq!(before.len(), 1);
    let eid = before.rows[0][0].clone();

    let t2 = kernel.begin("carol");
    let update = AlgBuilder::logical()
        .scan(
            DataModel::Document,
            entity_ref(&kernel, coll),
            AlgRowType::versioned_document(),
        )
        .modify(
            entity_ref(&kernel, coll),
            ModifyOperation::Update,
            vec!["a".into()],
            vec![RexNode::literal(2)],
        )
        .unwrap()
        .build()
        .unwrap();
    kernel.run(&t2, &update).unwrap();
    kernel.commit(&t2).unwrap();
    let c2 = kernel
        .context()
        .mvcc
        .commit_log(coll)
        .instant_of(t2.id())
        .unwrap();

    let t3 = kernel.begin("dave");
    let after = scan(&kernel, &t3, coll);
    assert_eq!(after.len(), 1, "exactly one current version");
    assert_eq!(after.rows[0][0], eid, "stable _eid across the update");
    assert_eq!(after.rows[0][1], PolyValue::Integer(c2), "_vid is T2's commit instant");
    assert_eq!(
        after.rows[0][2].get_path("a"),
        Some(&PolyValue::Integer(2))
    );
}

// ============================================================================
// S3 - Deadlock victim
// ============================================================================

#[test]
fn deadlock_selects_exactly_one_victim() {
    let kernel = Arc::new(kernel());
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let a = kernel
        .create_entity(ns, "a", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();
    let b = kernel
        .create_entity(ns, "b", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();

    let t1 = kernel.begin("alice");
    let t2 = kernel.begin("bob");
    kernel.run(&t1, &insert_plan(&kernel, a, 1)).unwrap();
    kernel.run(&t2, &insert_plan(&kernel, b, 2)).unwrap();

    let h1 = {
        let kernel = Arc::clone(&kernel);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || {
            let result = kernel.run(&t1, &insert_plan(&kernel, b, 1));
            match result {
                Ok(_) => {
                    kernel.commit(&t1).unwrap();
                    None
                }
                Err(error) => {
                    kernel.rollback(&t1, Some("deadlock loser"));
                    Some(error)
                }
            }
        })
    };
    let h2 = {
        let kernel = Arc::clone(&kernel);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            let result = kernel.run(&t2, &insert_plan(&kernel, a, 2));
            match result {
                Ok(_) => {
                    kernel.commit(&t2).unwrap();
                    None
                }
                Err(error) => {
                    kernel.rollback(&t2, Some("deadlock loser"));
                    Some(error)
                }
            }
        })
    };

    let e1 = h1.join().unwrap();
    let e2 = h2.join().unwrap();
    let failures: Vec<&DbError> = [&e1, &e2].into_iter().flatten().collect();
    assert_eq!(failures.len(), 1, "exactly one transaction loses");
    assert!(is_deadlock(failures[0]));

    // Final state reflects the survivor's writes only.
    let reader = kernel.begin("carol");
    let survivor = if e1.is_some() { 2 } else { 1 };
    for table in [a, b] {
        let rows = scan(&kernel, &reader, table);
        assert_eq!(rows.len(), 1, "one committed row per table");
        for row in &rows.rows {
            assert_eq!(row[2], PolyValue::Integer(survivor));
        }
    }
}

// ============================================================================
// S4 - Writer non-starvation
// ============================================================================

#[test]
fn queued_writer_beats_shared_stream() {
    let kernel = Arc::new(kernel());
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let a = kernel
        .create_entity(ns, "a", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();

    let context = kernel.context();
    let lockable = context.lockables.entity(ns, a);
    let detector = Arc::clone(&context.detector);

    let holder = kernel.begin("holder");
    holder
        .acquire(Arc::clone(&lockable), LockMode::Shared, &detector)
        .unwrap();

    let turn = Arc::new(AtomicUsize::new(0));

    let writer_txn = kernel.begin("writer");
    let writer_turn = {
        let lockable = Arc::clone(&lockable);
        let detector = Arc::clone(&detector);
        let turn = Arc::clone(&turn);
        thread::spawn(move || {
            writer_txn
                .acquire(Arc::clone(&lockable), LockMode::Exclusive, &detector)
                .unwrap();
            let at = turn.fetch_add(1, Ordering::SeqCst) + 1;
            lockable.release_all(writer_txn.id(), &detector);
            at
        })
    };

    // Give the writer time to enqueue behind the holder.
    thread::sleep(Duration::from_millis(50));

    let mut readers = Vec::new();
    for _ in 0..100 {
        let txn = kernel.begin("reader");
        let lockable = Arc::clone(&lockable);
        let detector = Arc::clone(&detector);
        let turn = Arc::clone(&turn);
        readers.push(thread::spawn(move || {
            txn.acquire(Arc::clone(&lockable), LockMode::Shared, &detector)
                .unwrap();
            let at = turn.fetch_add(1, Ordering::SeqCst) + 1;
            lockable.release_all(txn.id(), &detector);
            at
        }));
    }

    thread::sleep(Duration::from_millis(50));
    lockable.release_all(holder.id(), &detector);

    let writer_at = writer_turn.join().unwrap();
    for reader in readers {
        let reader_at = reader.join().unwrap();
        assert!(
            writer_at < reader_at,
            "writer acquired at turn {} after a late reader at {}",
            writer_at,
            reader_at
        );
    }
}

// ============================================================================
// S5 - Reserved key rejection
// ============================================================================

#[test]
fn reserved_keys_rejected_before_execution() {
    let kernel = kernel();
    let doc_ns = kernel
        .create_namespace("docs", DataModel::Document, true)
        .unwrap();
    let coll = kernel
        .create_entity(doc_ns, "c", DataModel::Document, vec!["d".into()], "hot")
        .unwrap();
    let graph_ns = kernel
        .create_namespace("graphs", DataModel::Graph, true)
        .unwrap();
    let graph = kernel
        .create_entity(graph_ns, "g", DataModel::Graph, vec!["g".into()], "hot")
        .unwrap();

    let txn = kernel.begin("alice");

    let doc_insert = AlgBuilder::logical()
        .document_values(vec![PolyValue::document([
            ("a", PolyValue::Integer(1)),
            ("_vid", PolyValue::Integer(5)),
        ])])
        .modify(
            entity_ref(&kernel, coll),
            ModifyOperation::Insert,
            vec![],
            vec![],
        )
        .unwrap()
        .build()
        .unwrap();
    let result = kernel.run(&txn, &doc_insert);
    assert!(
        matches!(result, Err(DbError::IllegalField { ref field }) if field == "_vid"),
        "document insert with _vid must be rejected"
    );

    let node_insert = AlgBuilder::logical()
        .lpg_values(
            vec![PolyValue::document([
                ("label", PolyValue::Text("person".into())),
                ("_eid", PolyValue::Integer(7)),
            ])],
            vec![],
        )
        .modify(
            entity_ref(&kernel, graph),
            ModifyOperation::Insert,
            vec![],
            vec![],
        )
        .unwrap()
        .build()
        .unwrap();
    let result = kernel.run(&txn, &node_insert);
    assert!(
        matches!(result, Err(DbError::IllegalField { ref field }) if field == "_eid"),
        "graph insert with _eid must be rejected"
    );
}

// ============================================================================
// S6 - Two-phase commit abort
// ============================================================================

/// A store whose prepare vote is rigged to refuse.
struct VetoAdapter {
    inner: MemoryAdapter,
}

impl Adapter for VetoAdapter {
    fn id(&self) -> u64 {
        self.inner.id()
    }
    fn unique_name(&self) -> &str {
        self.inner.unique_name()
    }
    fn adapter_name(&self) -> &str {
        "veto"
    }
    fn kind(&self) -> AdapterKind {
        AdapterKind::Store
    }
    fn capabilities(&self) -> AdapterCapabilities {
        self.inner.capabilities()
    }
    fn create_table(&self, entity: &polydb::catalog::Entity) -> polydb::Result<()> {
        self.inner.create_table(entity)
    }
    fn create_collection(&self, entity: &polydb::catalog::Entity) -> polydb::Result<()> {
        self.inner.create_collection(entity)
    }
    fn create_graph(&self, entity: &polydb::catalog::Entity) -> polydb::Result<()> {
        self.inner.create_graph(entity)
    }
    fn drop_table(&self, entity: &polydb::catalog::Entity) -> polydb::Result<()> {
        self.inner.drop_table(entity)
    }
    fn drop_collection(&self, entity: &polydb::catalog::Entity) -> polydb::Result<()> {
        self.inner.drop_collection(entity)
    }
    fn drop_graph(&self, entity: &polydb::catalog::Entity) -> polydb::Result<()> {
        self.inner.drop_graph(entity)
    }
    fn truncate(&self, entity: &polydb::catalog::Entity) -> polydb::Result<()> {
        self.inner.truncate(entity)
    }
    fn scan(
        &self,
        allocation: u64,
        builder: &mut AlgBuilder,
    ) -> polydb::Result<Arc<AlgNode>> {
        self.inner.scan(allocation, builder)
    }
    fn execute(
        &self,
        plan: &AlgNode,
        txn: &Transaction,
    ) -> polydb::Result<RowSet> {
        self.inner.execute(plan, txn)
    }
    fn prepare(&self, _xid: &polydb::transaction::Xid) -> polydb::Result<bool> {
        Ok(false)
    }
    fn commit(&self, xid: &polydb::transaction::Xid) -> polydb::Result<()> {
        self.inner.commit(xid)
    }
    fn rollback(&self, xid: &polydb::transaction::Xid) -> polydb::Result<()> {
        self.inner.rollback(xid)
    }
    fn shutdown(&self) -> polydb::Result<()> {
        self.inner.shutdown()
    }
}

fn register_veto_template(kernel: &Kernel) {
    let catalog = Arc::clone(kernel.catalog());
    let mvcc = Arc::clone(&kernel.context().mvcc);
    kernel
        .adapters()
        .register(
            AdapterDescriptor::new(
                "veto",
                "Store that refuses to prepare",
                AdapterKind::Store,
                vec![DeployMode::Embedded],
            ),
            BTreeMap::new(),
            Box::new(move |id, unique_name, _settings| {
                Ok(Arc::new(VetoAdapter {
                    inner: MemoryAdapter::new(
                        id,
                        unique_name,
                        Arc::clone(&catalog),
                        Arc::clone(&mvcc),
                    ),
                }))
            }),
        )
        .unwrap();
}

#[test]
fn prepare_refusal_aborts_all_participants() {
    let kernel = kernel();
    register_veto_template(&kernel);
    kernel
        .adapters()
        .deploy("veto", "flaky", BTreeMap::new())
        .unwrap();

    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let healthy = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();
    let doomed = kernel
        .create_entity(ns, "u", DataModel::Relational, vec!["x".into()], "flaky")
        .unwrap();

    let txn = kernel.begin("alice");
    kernel.run(&txn, &insert_plan(&kernel, healthy, 1)).unwrap();
    kernel.run(&txn, &insert_plan(&kernel, doomed, 2)).unwrap();

    let result = kernel.commit(&txn);
    assert!(
        matches!(result, Err(DbError::PrepareFailed { ref adapter, .. }) if adapter == "flaky")
    );

    // No commit instant was issued for either entity.
    assert!(kernel.context().mvcc.commit_log(healthy).is_empty());
    assert!(kernel.context().mvcc.commit_log(doomed).is_empty());

    // All participants rolled back: nothing is visible to a new reader.
    let reader = kernel.begin("bob");
    assert!(scan(&kernel, &reader, healthy).is_empty());
    assert!(scan(&kernel, &reader, doomed).is_empty());

    // Locks were released: a fresh writer proceeds without blocking.
    let writer = kernel.begin("carol");
    kernel.run(&writer, &insert_plan(&kernel, healthy, 3)).unwrap();
    kernel.commit(&writer).unwrap();
}

#[test]
fn prepare_skipped_when_two_pc_disabled() {
    let config = KernelConfig {
        two_pc_mode: false,
        ..KernelConfig::default()
    };
    let kernel = Kernel::new(config).unwrap();
    register_veto_template(&kernel);
    kernel
        .adapters()
        .deploy("veto", "flaky", BTreeMap::new())
        .unwrap();
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let table = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "flaky")
        .unwrap();

    let txn = kernel.begin("alice");
    kernel.run(&txn, &insert_plan(&kernel, table, 1)).unwrap();
    kernel.commit(&txn).unwrap();
}

// ============================================================================
// Write conflicts and constraints
// ============================================================================

#[test]
fn first_committer_wins_on_entity_writes() {
    let kernel = kernel();
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let table = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();

    let t1 = kernel.begin("alice");
    let t2 = kernel.begin("bob");

    kernel.run(&t1, &insert_plan(&kernel, table, 1)).unwrap();
    kernel.commit(&t1).unwrap();

    // T2's snapshot predates T1's commit instant; its write loses.
    kernel.run(&t2, &insert_plan(&kernel, table, 2)).unwrap();
    let result = kernel.commit(&t2);
    assert!(matches!(result, Err(DbError::Conflict { .. })));
    assert!(result.unwrap_err().retry_advisable());

    // The retry against a fresh snapshot succeeds.
    let retry = kernel.begin("bob");
    kernel.run(&retry, &insert_plan(&kernel, table, 2)).unwrap();
    kernel.commit(&retry).unwrap();
}

#[test]
fn on_commit_constraint_enforcement() {
    let kernel = kernel();
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let table = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();
    kernel
        .catalog()
        .add_constraint(
            table,
            "t_pk",
            ConstraintKind::PrimaryKey {
                fields: vec!["x".into()],
            },
        )
        .unwrap();

    let t1 = kernel.begin("alice");
    kernel.run(&t1, &insert_plan(&kernel, table, 1)).unwrap();
    kernel.commit(&t1).unwrap();

    let t2 = kernel.begin("bob");
    kernel.run(&t2, &insert_plan(&kernel, table, 1)).unwrap();
    let result = kernel.commit(&t2);
    assert!(matches!(result, Err(DbError::ConstraintViolation(_))));

    // The rollback left only the first row behind.
    let reader = kernel.begin("carol");
    assert_eq!(scan(&kernel, &reader, table).len(), 1);
}

// ============================================================================
// Relational update rewrite, end to end
// ============================================================================

#[test]
fn relational_update_creates_new_version_with_stable_eid() {
    let kernel = kernel();
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let table = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();

    let t1 = kernel.begin("alice");
    kernel.run(&t1, &insert_plan(&kernel, table, 1)).unwrap();
    kernel.commit(&t1).unwrap();

    let reader = kernel.begin("bob");
    let before = scan(&kernel, &reader, table);
    let eid = before.rows[0][0].clone();

    let t2 = kernel.begin("carol");
    let update = AlgBuilder::logical()
        .scan(
            DataModel::Relational,
            entity_ref(&kernel, table),
            AlgRowType::versioned_relational(["x"]),
        )
        .modify(
            entity_ref(&kernel, table),
            ModifyOperation::Update,
            vec!["x".into()],
            vec![RexNode::literal(5)],
        )
        .unwrap()
        .build()
        .unwrap();
    kernel.run(&t2, &update).unwrap();

    // Before T2 commits, the old reader still sees x = 1.
    assert_eq!(
        scan(&kernel, &reader, table).rows[0][2],
        PolyValue::Integer(1)
    );

    kernel.commit(&t2).unwrap();

    let t3 = kernel.begin("dave");
    let after = scan(&kernel, &t3, table);
    assert_eq!(after.len(), 1);
    assert_eq!(after.rows[0][0], eid);
    assert_eq!(after.rows[0][2], PolyValue::Integer(5));
}

#[test]
fn delete_hides_tuple_from_later_snapshots() {
    let kernel = kernel();
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let table = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();

    let t1 = kernel.begin("alice");
    kernel.run(&t1, &insert_plan(&kernel, table, 1)).unwrap();
    kernel.commit(&t1).unwrap();

    let old_reader = kernel.begin("bob");

    let t2 = kernel.begin("carol");
    let delete = AlgBuilder::logical()
        .scan(
            DataModel::Relational,
            entity_ref(&kernel, table),
            AlgRowType::versioned_relational(["x"]),
        )
        .modify(
            entity_ref(&kernel, table),
            ModifyOperation::Delete,
            vec![],
            vec![],
        )
        .unwrap()
        .build()
        .unwrap();
    kernel.run(&t2, &delete).unwrap();
    kernel.commit(&t2).unwrap();

    // The old snapshot still sees the tuple; new snapshots do not.
    assert_eq!(scan(&kernel, &old_reader, table).len(), 1);
    let t3 = kernel.begin("dave");
    assert!(scan(&kernel, &t3, table).is_empty());
}

// ============================================================================
// Relational-only stores through the scan delegate
// ============================================================================

#[test]
fn delegate_serves_documents_and_graphs_from_relational_store() {
    let kernel = kernel();
    let mut settings = BTreeMap::new();
    settings.insert("model_support".to_string(), "relational".to_string());
    kernel
        .adapters()
        .deploy("memory", "cold", settings)
        .unwrap();

    // Delegated entities live in a plain namespace.
    let doc_ns = kernel
        .create_namespace("docs", DataModel::Document, false)
        .unwrap();
    let coll = kernel
        .create_entity(doc_ns, "c", DataModel::Document, vec!["d".into()], "cold")
        .unwrap();
    let graph_ns = kernel
        .create_namespace("graphs", DataModel::Graph, false)
        .unwrap();
    let graph = kernel
        .create_entity(graph_ns, "g", DataModel::Graph, vec!["g".into()], "cold")
        .unwrap();

    let txn = kernel.begin("alice");
    let insert_doc = AlgBuilder::logical()
        .document_values(vec![PolyValue::document([("a", PolyValue::Integer(1))])])
        .modify(
            entity_ref(&kernel, coll),
            ModifyOperation::Insert,
            vec![],
            vec![],
        )
        .unwrap()
        .build()
        .unwrap();
    kernel.run(&txn, &insert_doc).unwrap();

    let scan_doc = AlgBuilder::logical()
        .scan(
            DataModel::Document,
            entity_ref(&kernel, coll),
            AlgRowType::versioned_document(),
        )
        .build()
        .unwrap();
    let docs = kernel.run(&txn, &scan_doc).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(
        docs.rows[0][2].get_path("a"),
        Some(&PolyValue::Integer(1))
    );

    let insert_graph = AlgBuilder::logical()
        .lpg_values(
            vec![
                PolyValue::document([
                    ("label", PolyValue::Text("person".into())),
                    ("name", PolyValue::Text("ada".into())),
                ]),
                PolyValue::document([("label", PolyValue::Text("city".into()))]),
            ],
            vec![],
        )
        .modify(
            entity_ref(&kernel, graph),
            ModifyOperation::Insert,
            vec![],
            vec![],
        )
        .unwrap()
        .build()
        .unwrap();
    kernel.run(&txn, &insert_graph).unwrap();

    let match_people = AlgBuilder::logical()
        .scan(
            DataModel::Graph,
            entity_ref(&kernel, graph),
            AlgRowType::versioned_graph(),
        )
        .graph_match(MatchKind::Node, vec!["person".into()], "n")
        .unwrap()
        .build()
        .unwrap();
    let people = kernel.run(&txn, &match_people).unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(
        people.rows[0][2].get_path("properties.name"),
        Some(&PolyValue::Text("ada".into()))
    );
    kernel.commit(&txn).unwrap();
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn client_cancel_interrupts_blocked_transaction() {
    let kernel = Arc::new(kernel());
    let ns = kernel
        .create_namespace("public", DataModel::Relational, true)
        .unwrap();
    let table = kernel
        .create_entity(ns, "t", DataModel::Relational, vec!["x".into()], "hot")
        .unwrap();

    let holder = kernel.begin("alice");
    kernel.run(&holder, &insert_plan(&kernel, table, 1)).unwrap();

    let blocked = kernel.begin("bob");
    let blocked_id = blocked.id();
    let handle = {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || {
            let result = kernel.run(&blocked, &insert_plan(&kernel, table, 2));
            if result.is_err() {
                kernel.rollback(&blocked, Some("cancelled"));
            }
            result.map(|_| ())
        })
    };

    thread::sleep(Duration::from_millis(50));
    kernel.transactions().cancel(blocked_id);

    let result = handle.join().unwrap();
    assert!(result.is_err(), "cancelled waiter must surface an error");
    assert!(is_deadlock(&result.unwrap_err()));

    kernel.commit(&holder).unwrap();
}
