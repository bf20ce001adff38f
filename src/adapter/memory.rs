// In-memory store adapter.
//
// The reference store the kernel ships with: per-entity row stores with full
// version history for MVCC namespaces and bare rows elsewhere. Staged
// versions live next to committed ones under `-txn`; commit flips them to
// the instant recorded in the entity's commit log, rollback drops them.
// In relational-only mode the adapter follows the scan delegate's backing
// layouts for collections and graphs.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::algebra::node::{AlgNode, EntityRef};
use crate::algebra::types::{AlgField, AlgRowType, PolyType, RowSet};
use crate::algebra::AlgBuilder;
use crate::catalog::{Catalog, Entity};
use crate::common::{
    AdapterId, AllocationId, DataModel, EntityId, EntryId, PolyValue, TransactionId,
};
use crate::error::{DbError, Result};
use crate::execution::{Interpreter, StorageBackend, VersionedRow};
use crate::mvcc::MvccState;
use crate::transaction::{Transaction, Xid};

use super::delegate::{graph_part_id, GraphPart, RelationalScanDelegate};
use super::{Adapter, AdapterCapabilities, AdapterDescriptor, AdapterKind, DeployMode};

#[derive(Debug, Clone, Copy, PartialEq)]
enum StoreKind {
    /// Rows held directly.
    Rows,
    /// Backing table of a delegated collection; inserts allocate the id.
    AutoIdRows,
    /// Marker for a delegated graph whose data lives in the part stores.
    GraphParts,
}

struct Store {
    kind: StoreKind,
    versioned: bool,
    columns: Vec<String>,
    versions: RwLock<Vec<VersionedRow>>,
    plain: RwLock<Vec<Vec<PolyValue>>>,
    next_id: AtomicI64,
}

impl Store {
    fn new(kind: StoreKind, versioned: bool, columns: Vec<String>) -> Self {
        Self {
            kind,
            versioned,
            columns,
            versions: RwLock::new(Vec::new()),
            plain: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

/// The in-process reference store.
pub struct MemoryAdapter {
    id: AdapterId,
    unique_name: String,
    capabilities: AdapterCapabilities,
    catalog: Arc<Catalog>,
    mvcc: Arc<MvccState>,
    stores: DashMap<EntityId, Store>,
}

impl MemoryAdapter {
    pub const ADAPTER_NAME: &'static str = "memory";

    /// A store speaking all three models natively.
    pub fn new(
        id: AdapterId,
        unique_name: impl Into<String>,
        catalog: Arc<Catalog>,
        mvcc: Arc<MvccState>,
    ) -> Self {
        Self {
            id,
            unique_name: unique_name.into(),
            capabilities: AdapterCapabilities::polystore(),
            catalog,
            mvcc,
            stores: DashMap::new(),
        }
    }

    /// A store limited to relational primitives; document and graph
    /// entities are served through the scan delegate.
    pub fn relational_only(
        id: AdapterId,
        unique_name: impl Into<String>,
        catalog: Arc<Catalog>,
        mvcc: Arc<MvccState>,
    ) -> Self {
        Self {
            capabilities: AdapterCapabilities::relational_only(),
            ..Self::new(id, unique_name, catalog, mvcc)
        }
    }

    /// Template descriptor for the registry.
    pub fn descriptor() -> AdapterDescriptor {
        AdapterDescriptor::new(
            Self::ADAPTER_NAME,
            "In-process row store with full version history",
            AdapterKind::Store,
            vec![DeployMode::Embedded, DeployMode::Docker],
        )
    }

    fn store(&self, entity: EntityId) -> Result<dashmap::mapref::one::Ref<'_, EntityId, Store>> {
        self.stores
            .get(&entity)
            .ok_or_else(|| DbError::Execution(format!("entity {} not deployed here", entity)))
    }

    fn entity_ref(&self, entity: &Entity) -> EntityRef {
        EntityRef {
            id: entity.id,
            namespace: entity.namespace,
            name: entity.name.clone(),
        }
    }

    fn drop_store(&self, entity: &Entity) {
        self.stores.remove(&entity.id);
        for part in GraphPart::ALL {
            self.stores.remove(&graph_part_id(entity.id, part));
        }
    }
}

impl Adapter for MemoryAdapter {
    fn id(&self) -> AdapterId {
        self.id
    }

    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn adapter_name(&self) -> &str {
        Self::ADAPTER_NAME
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Store
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    fn create_table(&self, entity: &Entity) -> Result<()> {
        let versioned = self.catalog.snapshot().is_mvcc(entity.id);
        self.stores.insert(
            entity.id,
            Store::new(StoreKind::Rows, versioned, entity.columns.clone()),
        );
        Ok(())
    }

    fn create_collection(&self, entity: &Entity) -> Result<()> {
        let versioned = self.catalog.snapshot().is_mvcc(entity.id);
        if self.capabilities.document {
            self.stores.insert(
                entity.id,
                Store::new(StoreKind::Rows, versioned, vec!["d".into()]),
            );
            return Ok(());
        }
        if versioned {
            return Err(DbError::Catalog(format!(
                "collection '{}' needs a plain namespace: the scan delegate does not version documents",
                entity.name
            )));
        }
        self.stores.insert(
            entity.id,
            Store::new(StoreKind::AutoIdRows, false, vec!["id".into(), "d".into()]),
        );
        Ok(())
    }

    fn create_graph(&self, entity: &Entity) -> Result<()> {
        let versioned = self.catalog.snapshot().is_mvcc(entity.id);
        if self.capabilities.graph {
            self.stores.insert(
                entity.id,
                Store::new(StoreKind::Rows, versioned, vec!["g".into()]),
            );
            return Ok(());
        }
        if versioned {
            return Err(DbError::Catalog(format!(
                "graph '{}' needs a plain namespace: the scan delegate does not version graphs",
                entity.name
            )));
        }
        self.stores
            .insert(entity.id, Store::new(StoreKind::GraphParts, false, vec![]));
        for part in GraphPart::ALL {
            let columns = part
                .row_type()
                .fields
                .iter()
                .map(|f| f.name.clone())
                .collect();
            self.stores.insert(
                graph_part_id(entity.id, part),
                Store::new(StoreKind::Rows, false, columns),
            );
        }
        Ok(())
    }

    fn drop_table(&self, entity: &Entity) -> Result<()> {
        self.drop_store(entity);
        Ok(())
    }

    fn drop_collection(&self, entity: &Entity) -> Result<()> {
        self.drop_store(entity);
        Ok(())
    }

    fn drop_graph(&self, entity: &Entity) -> Result<()> {
        self.drop_store(entity);
        Ok(())
    }

    fn truncate(&self, entity: &Entity) -> Result<()> {
        let ids: Vec<EntityId> = std::iter::once(entity.id)
            .chain(GraphPart::ALL.iter().map(|&p| graph_part_id(entity.id, p)))
            .collect();
        for id in ids {
            if let Some(store) = self.stores.get(&id) {
                store.versions.write().clear();
                store.plain.write().clear();
            }
        }
        Ok(())
    }

    fn scan(&self, allocation: AllocationId, builder: &mut AlgBuilder) -> Result<Arc<AlgNode>> {
        let snapshot = self.catalog.snapshot();
        let placement = snapshot
            .placement_by_allocation(allocation)
            .ok_or_else(|| DbError::Catalog(format!("allocation {} unknown", allocation)))?;
        let entity = snapshot
            .entity(placement.entity)
            .ok_or_else(|| DbError::Catalog(format!("entity {} unknown", placement.entity)))?;
        let entity_ref = self.entity_ref(entity);
        let versioned = snapshot.is_mvcc(entity.id);

        match entity.data_model {
            DataModel::Relational => {
                let row_type = if versioned {
                    AlgRowType::versioned_relational(entity.columns.iter().map(String::as_str))
                } else {
                    AlgRowType::new(
                        entity
                            .columns
                            .iter()
                            .map(|c| AlgField::new(c.clone(), PolyType::Any))
                            .collect(),
                    )
                };
                builder.scan(DataModel::Relational, entity_ref, row_type);
                Ok(builder.peek()?.clone())
            }
            DataModel::Document if self.capabilities.document => {
                let row_type = if versioned {
                    AlgRowType::versioned_document()
                } else {
                    AlgRowType::new(vec![AlgField::new("d", PolyType::Document)])
                };
                builder.scan(DataModel::Document, entity_ref, row_type);
                Ok(builder.peek()?.clone())
            }
            DataModel::Document => RelationalScanDelegate::document_scan(builder, &entity_ref),
            DataModel::Graph if self.capabilities.graph => {
                let row_type = if versioned {
                    AlgRowType::versioned_graph()
                } else {
                    AlgRowType::new(vec![AlgField::new("g", PolyType::Document)])
                };
                builder.scan(DataModel::Graph, entity_ref, row_type);
                Ok(builder.peek()?.clone())
            }
            DataModel::Graph => RelationalScanDelegate::graph_scan(builder, &entity_ref),
        }
    }

    fn execute(&self, plan: &AlgNode, txn: &Transaction) -> Result<RowSet> {
        txn.record_adapter(self.id);
        let snapshot = self.catalog.snapshot();
        Interpreter::new(self, &self.mvcc, &snapshot, txn).execute(plan)
    }

    fn prepare(&self, _xid: &Xid) -> Result<bool> {
        Ok(true)
    }

    fn commit(&self, xid: &Xid) -> Result<()> {
        for entry in self.stores.iter() {
            if !entry.versioned {
                continue;
            }
            let log = self.mvcc.commit_log(*entry.key());
            let Some(instant) = log.instant_of(xid.local) else {
                continue;
            };
            let mut versions = entry.versions.write();
            for row in versions.iter_mut() {
                if row.vid == -xid.local {
                    row.vid = instant;
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        for entry in self.stores.iter() {
            if entry.versioned {
                entry.versions.write().retain(|row| row.vid != -xid.local);
            }
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.stores.clear();
        Ok(())
    }

    fn fetch_preview(&self, entity: &Entity, limit: usize) -> Result<Vec<PolyValue>> {
        let store = self.store(entity.id)?;
        if store.versioned {
            Ok(store
                .versions
                .read()
                .iter()
                .filter(|row| !row.deleted && row.vid > 0)
                .take(limit)
                .map(|row| PolyValue::Array(row.values.clone()))
                .collect())
        } else {
            Ok(store
                .plain
                .read()
                .iter()
                .take(limit)
                .map(|row| PolyValue::Array(row.clone()))
                .collect())
        }
    }
}

impl StorageBackend for MemoryAdapter {
    fn scan_versions(&self, entity: EntityId) -> Result<Vec<VersionedRow>> {
        let store = self.store(entity)?;
        if !store.versioned {
            return Err(DbError::Execution(format!(
                "entity {} is not versioned",
                entity
            )));
        }
        let versions = store.versions.read().clone();
        Ok(versions)
    }

    fn insert_versions(&self, entity: EntityId, rows: Vec<VersionedRow>) -> Result<usize> {
        let store = self.store(entity)?;
        let count = rows.len();
        store.versions.write().extend(rows);
        Ok(count)
    }

    fn delete_version(&self, entity: EntityId, eid: EntryId, txn: TransactionId) -> Result<()> {
        let store = self.store(entity)?;
        let mut versions = store.versions.write();
        // Staged rows of the deleting transaction disappear outright.
        versions.retain(|row| !(row.eid == eid && row.vid == -txn && !row.deleted));
        // Committed history stays; a staged tombstone shadows it.
        let has_other_versions = versions.iter().any(|row| row.eid == eid);
        let has_tombstone = versions
            .iter()
            .any(|row| row.eid == eid && row.vid == -txn && row.deleted);
        if has_other_versions && !has_tombstone {
            versions.push(VersionedRow {
                eid,
                vid: -txn,
                deleted: true,
                values: vec![PolyValue::Null; store.columns.len()],
            });
        }
        Ok(())
    }

    fn scan_plain(&self, entity: EntityId) -> Result<Vec<Vec<PolyValue>>> {
        let store = self.store(entity)?;
        match store.kind {
            StoreKind::GraphParts => Err(DbError::Execution(
                "delegated graphs are scanned through their part tables".into(),
            )),
            _ => Ok(store.plain.read().clone()),
        }
    }

    fn insert_plain(&self, entity: EntityId, rows: Vec<Vec<PolyValue>>) -> Result<usize> {
        let kind = self.store(entity)?.kind;
        match kind {
            StoreKind::Rows => {
                let store = self.store(entity)?;
                let count = rows.len();
                store.plain.write().extend(rows);
                Ok(count)
            }
            StoreKind::AutoIdRows => {
                let store = self.store(entity)?;
                let count = rows.len();
                let mut plain = store.plain.write();
                for row in rows {
                    let id = store.next_id.fetch_add(1, Ordering::SeqCst);
                    let mut out = vec![PolyValue::Integer(id)];
                    out.extend(row);
                    plain.push(out);
                }
                Ok(count)
            }
            StoreKind::GraphParts => self.insert_graph_elements(entity, rows),
        }
    }

    fn update_plain(
        &self,
        entity: EntityId,
        matched: Vec<Vec<PolyValue>>,
        updated: Vec<Vec<PolyValue>>,
    ) -> Result<usize> {
        let store = self.store(entity)?;
        if store.kind == StoreKind::GraphParts {
            return Err(DbError::Execution(
                "the scan delegate does not rewrite graph elements in place".into(),
            ));
        }
        let mut plain = store.plain.write();
        let mut count = 0;
        for (old, new) in matched.into_iter().zip(updated) {
            if let Some(at) = plain.iter().position(|row| *row == old) {
                plain[at] = new;
                count += 1;
            }
        }
        Ok(count)
    }

    fn delete_plain(&self, entity: EntityId, matched: Vec<Vec<PolyValue>>) -> Result<usize> {
        let store = self.store(entity)?;
        if store.kind == StoreKind::GraphParts {
            return Err(DbError::Execution(
                "the scan delegate does not delete graph elements in place".into(),
            ));
        }
        let mut plain = store.plain.write();
        let mut count = 0;
        for old in matched {
            if let Some(at) = plain.iter().position(|row| *row == old) {
                plain.remove(at);
                count += 1;
            }
        }
        Ok(count)
    }
}

impl MemoryAdapter {
    /// Decomposes graph element rows (`[g]`) into the four part tables.
    fn insert_graph_elements(
        &self,
        entity: EntityId,
        rows: Vec<Vec<PolyValue>>,
    ) -> Result<usize> {
        let marker = self.store(entity)?;
        let count = rows.len();
        for row in rows {
            let element = row
                .first()
                .ok_or_else(|| DbError::Execution("empty graph element row".into()))?;
            let kind = element
                .get_path("kind")
                .and_then(|k| k.as_text())
                .ok_or_else(|| DbError::Execution("graph element without kind".into()))?
                .to_string();
            let id = marker.next_id.fetch_add(1, Ordering::SeqCst);
            let label = element.get_path("label").cloned().unwrap_or(PolyValue::Null);
            let properties = match element.get_path("properties") {
                Some(PolyValue::Document(map)) => map.clone(),
                _ => Default::default(),
            };

            match kind.as_str() {
                "NODE" => {
                    let nodes = self.store(graph_part_id(entity, GraphPart::Nodes))?;
                    nodes.plain.write().push(vec![PolyValue::Integer(id), label]);
                    let props = self.store(graph_part_id(entity, GraphPart::NodeProperties))?;
                    let mut props = props.plain.write();
                    for (key, value) in properties {
                        props.push(vec![PolyValue::Integer(id), PolyValue::Text(key), value]);
                    }
                }
                "EDGE" => {
                    let edges = self.store(graph_part_id(entity, GraphPart::Edges))?;
                    edges.plain.write().push(vec![
                        PolyValue::Integer(id),
                        element.get_path("source").cloned().unwrap_or(PolyValue::Null),
                        element.get_path("target").cloned().unwrap_or(PolyValue::Null),
                        label,
                    ]);
                    let props = self.store(graph_part_id(entity, GraphPart::EdgeProperties))?;
                    let mut props = props.plain.write();
                    for (key, value) in properties {
                        props.push(vec![PolyValue::Integer(id), PolyValue::Text(key), value]);
                    }
                }
                other => {
                    return Err(DbError::Execution(format!(
                        "unknown graph element kind '{}'",
                        other
                    )))
                }
            }
        }
        Ok(count)
    }
}

impl std::fmt::Debug for MemoryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAdapter")
            .field("id", &self.id)
            .field("unique_name", &self.unique_name)
            .field("stores", &self.stores.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EntityType, NamespaceId};

    fn fixture() -> (MemoryAdapter, EntityId, NamespaceId) {
        let catalog = Arc::new(Catalog::new());
        let mvcc = Arc::new(MvccState::new());
        let ns = catalog
            .add_namespace("public", DataModel::Relational, true)
            .unwrap();
        let table = catalog
            .add_entity(
                ns,
                "t",
                DataModel::Relational,
                EntityType::Entity,
                vec!["x".into()],
            )
            .unwrap();
        let adapter = MemoryAdapter::new(7, "hot", Arc::clone(&catalog), Arc::clone(&mvcc));
        let snapshot = catalog.snapshot();
        adapter.create_table(snapshot.entity(table).unwrap()).unwrap();
        (adapter, table, ns)
    }

    fn staged_row(eid: EntryId, txn: TransactionId, x: i64) -> VersionedRow {
        VersionedRow {
            eid,
            vid: -txn,
            deleted: false,
            values: vec![PolyValue::Integer(x)],
        }
    }

    #[test]
    fn test_commit_flips_staged_versions() {
        let (adapter, table, _) = fixture();
        adapter
            .insert_versions(table, vec![staged_row(1, 9, 42)])
            .unwrap();

        adapter.mvcc.commit_log(table).register(9, 15);
        adapter.commit(&Xid::new(0, 9)).unwrap();

        let versions = adapter.scan_versions(table).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].vid, 15);
    }

    #[test]
    fn test_rollback_drops_staged_versions() {
        let (adapter, table, _) = fixture();
        adapter
            .insert_versions(table, vec![staged_row(1, 9, 42)])
            .unwrap();
        adapter.rollback(&Xid::new(0, 9)).unwrap();
        assert!(adapter.scan_versions(table).unwrap().is_empty());
    }

    #[test]
    fn test_delete_of_own_staged_row_leaves_no_tombstone() {
        let (adapter, table, _) = fixture();
        adapter
            .insert_versions(table, vec![staged_row(1, 9, 42)])
            .unwrap();
        adapter.delete_version(table, 1, 9).unwrap();
        assert!(adapter.scan_versions(table).unwrap().is_empty());
    }

    #[test]
    fn test_delete_of_committed_row_stages_tombstone() {
        let (adapter, table, _) = fixture();
        adapter
            .insert_versions(
                table,
                vec![VersionedRow {
                    eid: 1,
                    vid: 4,
                    deleted: false,
                    values: vec![PolyValue::Integer(42)],
                }],
            )
            .unwrap();
        adapter.delete_version(table, 1, 9).unwrap();

        let versions = adapter.scan_versions(table).unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().any(|r| r.vid == -9 && r.deleted));
        // The committed history is untouched.
        assert!(versions.iter().any(|r| r.vid == 4 && !r.deleted));
    }

    #[test]
    fn test_truncate_clears_rows_but_keeps_store() {
        let (adapter, table, _) = fixture();
        adapter
            .insert_versions(table, vec![staged_row(1, 9, 42)])
            .unwrap();
        let snapshot = adapter.catalog.snapshot();
        adapter.truncate(snapshot.entity(table).unwrap()).unwrap();
        assert!(adapter.scan_versions(table).unwrap().is_empty());
    }
}
