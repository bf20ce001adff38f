// Physical-plan interpretation.
//
// Adapters that keep their data in-process execute physical subtrees through
// this interpreter; it is the execution half of the adapter contract. The
// interpreter is CPU-bound and never blocks: locks are taken by the kernel
// before dispatch, and the only state it touches is the backing store it was
// handed and the MVCC bookkeeping of the scanned entities.

use std::collections::{BTreeMap, HashMap};

use crate::algebra::node::{
    AggFunction, AggregateCall, AlgNode, AlgOperator, EntityRef, FieldCollation, JoinKind,
    MatchKind, ModifyOperation,
};
use crate::algebra::rex::{RexNode, RexOp};
use crate::algebra::types::{AlgRowType, RowSet};
use crate::catalog::CatalogSnapshot;
use crate::common::{
    EntityId, EntryId, PolyValue, TransactionId, VersionId, ENTRY_ID_FIELD, VERSION_FIELD,
};
use crate::error::{DbError, Result};
use crate::mvcc::{MvccState, VersionJudge};
use crate::transaction::Transaction;

/// One stored version of one tuple; payload excludes `_eid`/`_vid`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRow {
    pub eid: EntryId,
    pub vid: VersionId,
    pub deleted: bool,
    pub values: Vec<PolyValue>,
}

/// Storage surface the interpreter drives.
///
/// Versioned entities store every version of every tuple; plain entities
/// store bare rows. The backend never interprets `_vid` itself.
pub trait StorageBackend: Send + Sync {
    /// Every stored version, tombstones included.
    fn scan_versions(&self, entity: EntityId) -> Result<Vec<VersionedRow>>;

    fn insert_versions(&self, entity: EntityId, rows: Vec<VersionedRow>) -> Result<usize>;

    /// Stages a deletion of the given tuple under the transaction's
    /// negative version.
    fn delete_version(&self, entity: EntityId, eid: EntryId, txn: TransactionId) -> Result<()>;

    /// Bare rows of an unversioned entity.
    fn scan_plain(&self, entity: EntityId) -> Result<Vec<Vec<PolyValue>>>;

    fn insert_plain(&self, entity: EntityId, rows: Vec<Vec<PolyValue>>) -> Result<usize>;

    /// Replaces matched rows of an unversioned entity with their updated
    /// form.
    fn update_plain(
        &self,
        entity: EntityId,
        matched: Vec<Vec<PolyValue>>,
        updated: Vec<Vec<PolyValue>>,
    ) -> Result<usize>;

    fn delete_plain(&self, entity: EntityId, matched: Vec<Vec<PolyValue>>) -> Result<usize>;
}

/// Interprets physical plans over one storage backend.
pub struct Interpreter<'a> {
    backend: &'a dyn StorageBackend,
    mvcc: &'a MvccState,
    catalog: &'a CatalogSnapshot,
    txn: &'a Transaction,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        backend: &'a dyn StorageBackend,
        mvcc: &'a MvccState,
        catalog: &'a CatalogSnapshot,
        txn: &'a Transaction,
    ) -> Self {
        Self {
            backend,
            mvcc,
            catalog,
            txn,
        }
    }

    pub fn execute(&self, plan: &AlgNode) -> Result<RowSet> {
        match plan.op() {
            AlgOperator::Scan { entity, row_type } => self.execute_scan(entity, row_type),
            AlgOperator::Filter { condition } => self.execute_filter(plan, condition),
            AlgOperator::Project { exprs, .. } => {
                let input = self.execute(plan.input(0))?;
                let mut rows = Vec::with_capacity(input.rows.len());
                for row in &input.rows {
                    let mut out = Vec::with_capacity(exprs.len());
                    for expr in exprs {
                        out.push(eval(expr, row, &input.row_type)?);
                    }
                    rows.push(out);
                }
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
            AlgOperator::Join { kind, condition } => self.execute_join(plan, *kind, condition),
            AlgOperator::Union { all } => {
                let mut left = self.execute(plan.input(0))?;
                let right = self.execute(plan.input(1))?;
                left.rows.extend(right.rows);
                if !all {
                    dedup_rows(&mut left.rows);
                }
                Ok(RowSet::new(plan.row_type().clone(), left.rows))
            }
            AlgOperator::Intersect { all } => {
                let left = self.execute(plan.input(0))?;
                let right = self.execute(plan.input(1))?;
                let right_keys: Vec<String> = right.rows.iter().map(|r| row_key(r)).collect();
                let mut rows: Vec<Vec<PolyValue>> = left
                    .rows
                    .into_iter()
                    .filter(|row| right_keys.contains(&row_key(row)))
                    .collect();
                if !all {
                    dedup_rows(&mut rows);
                }
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
            AlgOperator::Minus { all } => {
                let left = self.execute(plan.input(0))?;
                let right = self.execute(plan.input(1))?;
                let right_keys: Vec<String> = right.rows.iter().map(|r| row_key(r)).collect();
                let mut rows: Vec<Vec<PolyValue>> = left
                    .rows
                    .into_iter()
                    .filter(|row| !right_keys.contains(&row_key(row)))
                    .collect();
                if !all {
                    dedup_rows(&mut rows);
                }
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
            AlgOperator::Sort {
                collation,
                offset,
                fetch,
            } => {
                let mut input = self.execute(plan.input(0))?;
                sort_rows(&mut input.rows, collation);
                let start = offset.unwrap_or(0).min(input.rows.len());
                let end = match fetch {
                    Some(fetch) => (start + fetch).min(input.rows.len()),
                    None => input.rows.len(),
                };
                let rows = input.rows[start..end].to_vec();
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
            AlgOperator::Aggregate { group, calls } => self.execute_aggregate(plan, group, calls),
            AlgOperator::Values { tuples, .. } => {
                Ok(RowSet::new(plan.row_type().clone(), tuples.clone()))
            }
            AlgOperator::DocumentValues { documents } => Ok(RowSet::new(
                plan.row_type().clone(),
                documents.iter().map(|d| vec![d.clone()]).collect(),
            )),
            AlgOperator::LpgValues { nodes, edges } => {
                let mut rows = Vec::with_capacity(nodes.len() + edges.len());
                for node in nodes {
                    rows.push(vec![wrap_graph_element(node, MatchKind::Node)?]);
                }
                for edge in edges {
                    rows.push(vec![wrap_graph_element(edge, MatchKind::Edge)?]);
                }
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
            AlgOperator::Identifier { entity } => self.execute_identifier(plan, entity),
            AlgOperator::Modify {
                entity, operation, ..
            } => self.execute_modify(plan, entity, *operation),
            AlgOperator::Transformer { to, .. } => self.execute_transformer(plan, *to),
            AlgOperator::Match { kind, labels, .. } => {
                let input = self.execute(plan.input(0))?;
                let g_index = input
                    .row_type
                    .field_index("g")
                    .ok_or_else(|| DbError::Execution("match input lacks a 'g' payload".into()))?;
                let rows = input
                    .rows
                    .into_iter()
                    .filter(|row| graph_element_matches(&row[g_index], *kind, labels))
                    .collect();
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
            AlgOperator::Unwind { field } => {
                let input = self.execute(plan.input(0))?;
                let index = resolve_unwind_field(&input.row_type, field)?;
                let mut rows = Vec::new();
                for row in input.rows {
                    match &row[index] {
                        PolyValue::Array(items) => {
                            for item in items {
                                let mut expanded = row.clone();
                                expanded[index] = item.clone();
                                rows.push(expanded);
                            }
                        }
                        PolyValue::Null => {}
                        _ => rows.push(row),
                    }
                }
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
        }
    }

    /// A raw scan surfaces live tuples only; versioned entities are
    /// normally read through the snapshot filter instead.
    fn execute_scan(&self, entity: &EntityRef, row_type: &AlgRowType) -> Result<RowSet> {
        if self.catalog.is_mvcc(entity.id) {
            let rows = self
                .backend
                .scan_versions(entity.id)?
                .into_iter()
                .filter(|row| !row.deleted)
                .map(versioned_to_row)
                .collect();
            Ok(RowSet::new(row_type.clone(), rows))
        } else {
            Ok(RowSet::new(row_type.clone(), self.backend.scan_plain(entity.id)?))
        }
    }

    fn execute_filter(&self, plan: &AlgNode, condition: &RexNode) -> Result<RowSet> {
        // The snapshot-visibility filter is a row-set operation: it resolves
        // each tuple to its newest visible version. It is only ever planted
        // directly above a scan by the MVCC rewrite.
        if let RexNode::Call {
            op: RexOp::Visible, ..
        } = condition
        {
            let input = plan.input(0);
            let entity = match input.op() {
                AlgOperator::Scan { entity, .. } => entity.clone(),
                _ => {
                    return Err(DbError::internal(
                        "snapshot filter must sit directly on a scan",
                    ))
                }
            };
            let rows = self.snapshot_resolve(entity.id)?;
            return Ok(RowSet::new(plan.row_type().clone(), rows));
        }

        let input = self.execute(plan.input(0))?;
        let mut rows = Vec::new();
        for row in input.rows {
            if eval(condition, &row, &input.row_type)? == PolyValue::Boolean(true) {
                rows.push(row);
            }
        }
        Ok(RowSet::new(plan.row_type().clone(), rows))
    }

    /// Newest visible version of each tuple, tombstoned tuples dropped.
    fn snapshot_resolve(&self, entity: EntityId) -> Result<Vec<Vec<PolyValue>>> {
        let log = self.mvcc.commit_log(entity);
        let judge = VersionJudge::new(&log, self.txn.id(), self.txn.snapshot());

        let mut winners: HashMap<EntryId, (i64, VersionedRow)> = HashMap::new();
        for row in self.backend.scan_versions(entity)? {
            if !judge.is_visible(row.vid) {
                continue;
            }
            // Order among visible versions: own staged writes are newest,
            // committed versions order by their instant.
            let order = if row.vid == -self.txn.id() {
                i64::MAX
            } else if row.vid < 0 {
                log.instant_of(-row.vid).unwrap_or(0)
            } else {
                row.vid
            };
            match winners.get(&row.eid) {
                Some((best, _)) if *best >= order => {}
                _ => {
                    winners.insert(row.eid, (order, row));
                }
            }
        }

        let mut rows: Vec<VersionedRow> = winners
            .into_values()
            .filter_map(|(_, row)| (!row.deleted).then_some(row))
            .collect();
        rows.sort_by_key(|row| row.eid);
        Ok(rows.into_iter().map(versioned_to_row).collect())
    }

    fn execute_join(&self, plan: &AlgNode, kind: JoinKind, condition: &RexNode) -> Result<RowSet> {
        let left = self.execute(plan.input(0))?;
        let right = self.execute(plan.input(1))?;
        let joined_type = plan.row_type().clone();

        let mut rows = Vec::new();
        for left_row in &left.rows {
            let mut matched = false;
            for right_row in &right.rows {
                let mut combined = left_row.clone();
                combined.extend(right_row.iter().cloned());
                if condition.is_always_true()
                    || eval(condition, &combined, &joined_type)? == PolyValue::Boolean(true)
                {
                    matched = true;
                    rows.push(combined);
                }
            }
            if !matched && kind == JoinKind::Left {
                let mut combined = left_row.clone();
                combined.extend(std::iter::repeat(PolyValue::Null).take(right.row_type.field_count()));
                rows.push(combined);
            }
        }
        Ok(RowSet::new(joined_type, rows))
    }

    fn execute_aggregate(
        &self,
        plan: &AlgNode,
        group: &[usize],
        calls: &[AggregateCall],
    ) -> Result<RowSet> {
        let input = self.execute(plan.input(0))?;
        let mut groups: BTreeMap<String, (Vec<PolyValue>, Vec<Vec<PolyValue>>)> = BTreeMap::new();
        for row in input.rows {
            let key_values: Vec<PolyValue> = group.iter().map(|&i| row[i].clone()).collect();
            let key = row_key(&key_values);
            groups
                .entry(key)
                .or_insert_with(|| (key_values, Vec::new()))
                .1
                .push(row);
        }
        // A global aggregate over no rows still produces one group.
        if groups.is_empty() && group.is_empty() {
            groups.insert(String::new(), (Vec::new(), Vec::new()));
        }

        let mut rows = Vec::with_capacity(groups.len());
        for (_, (key_values, members)) in groups {
            let mut row = key_values;
            for call in calls {
                row.push(aggregate(call, &members)?);
            }
            rows.push(row);
        }
        Ok(RowSet::new(plan.row_type().clone(), rows))
    }

    fn execute_identifier(&self, plan: &AlgNode, entity: &EntityRef) -> Result<RowSet> {
        let input = self.execute(plan.input(0))?;
        let registry = self.mvcc.registry(entity.id);
        let staged_vid = -self.txn.id();

        let eid_index = input.row_type.field_index(ENTRY_ID_FIELD);
        let vid_index = input.row_type.field_index(VERSION_FIELD);
        let payload_indices: Vec<usize> = (0..input.row_type.field_count())
            .filter(|i| Some(*i) != eid_index && Some(*i) != vid_index)
            .collect();

        let mut rows = Vec::with_capacity(input.rows.len());
        for row in input.rows {
            let eid = match eid_index {
                Some(index) => row[index].as_integer().ok_or_else(|| {
                    DbError::internal("_eid column does not hold an integer")
                })?,
                None => registry.allocate_one(),
            };
            let mut out = vec![PolyValue::Integer(eid), PolyValue::Integer(staged_vid)];
            out.extend(payload_indices.iter().map(|&i| row[i].clone()));
            rows.push(out);
        }
        Ok(RowSet::new(plan.row_type().clone(), rows))
    }

    fn execute_modify(
        &self,
        plan: &AlgNode,
        entity: &EntityRef,
        operation: ModifyOperation,
    ) -> Result<RowSet> {
        let input = self.execute(plan.input(0))?;
        let mvcc = self.catalog.is_mvcc(entity.id);

        let count = match (operation, mvcc) {
            (ModifyOperation::Insert, true) => {
                let eid_index = input
                    .row_type
                    .field_index(ENTRY_ID_FIELD)
                    .ok_or_else(|| DbError::internal("versioned insert without _eid"))?;
                let vid_index = input
                    .row_type
                    .field_index(VERSION_FIELD)
                    .ok_or_else(|| DbError::internal("versioned insert without _vid"))?;
                let rows: Result<Vec<VersionedRow>> = input
                    .rows
                    .into_iter()
                    .map(|row| {
                        let eid = row[eid_index]
                            .as_integer()
                            .ok_or_else(|| DbError::internal("non-integer _eid"))?;
                        let vid = row[vid_index]
                            .as_integer()
                            .ok_or_else(|| DbError::internal("non-integer _vid"))?;
                        let values = row
                            .into_iter()
                            .enumerate()
                            .filter_map(|(i, v)| {
                                (i != eid_index && i != vid_index).then_some(v)
                            })
                            .collect();
                        Ok(VersionedRow {
                            eid,
                            vid,
                            deleted: false,
                            values,
                        })
                    })
                    .collect();
                self.backend.insert_versions(entity.id, rows?)?
            }
            (ModifyOperation::Delete, true) => {
                let eid_index = input
                    .row_type
                    .field_index(ENTRY_ID_FIELD)
                    .ok_or_else(|| DbError::internal("versioned delete without _eid"))?;
                let mut count = 0;
                for row in &input.rows {
                    let eid = row[eid_index]
                        .as_integer()
                        .ok_or_else(|| DbError::internal("non-integer _eid"))?;
                    self.backend.delete_version(entity.id, eid, self.txn.id())?;
                    count += 1;
                }
                count
            }
            (ModifyOperation::Update, true) => {
                // The MVCC rewrite turns versioned updates into inserts; an
                // update reaching execution is a rewrite bug.
                return Err(DbError::internal(
                    "versioned update was not rewritten to an insert",
                ));
            }
            (ModifyOperation::Insert, false) => {
                self.backend.insert_plain(entity.id, input.rows)?
            }
            (ModifyOperation::Delete, false) => {
                self.backend.delete_plain(entity.id, input.rows)?
            }
            (ModifyOperation::Update, false) => {
                let updates = plan_update_exprs(plan)?;
                let mut updated = Vec::with_capacity(input.rows.len());
                for row in &input.rows {
                    let mut next = row.clone();
                    for (target, source) in &updates {
                        let index = input.row_type.field_index(target).ok_or_else(|| {
                            DbError::Execution(format!("unknown update column '{}'", target))
                        })?;
                        next[index] = eval(source, row, &input.row_type)?;
                    }
                    updated.push(next);
                }
                self.backend.update_plain(entity.id, input.rows, updated)?
            }
        };

        self.txn.record_write(entity.id);
        Ok(RowSet::new(
            plan.row_type().clone(),
            vec![vec![PolyValue::Integer(count as i64)]],
        ))
    }

    fn execute_transformer(&self, plan: &AlgNode, to: crate::common::DataModel) -> Result<RowSet> {
        match to {
            crate::common::DataModel::Document => {
                let input = self.execute(plan.input(0))?;
                let mut rows = Vec::with_capacity(input.rows.len());
                for row in input.rows {
                    // Backing rows are either the delegate layout `(id, d)`
                    // or already versioned `(_eid, _vid, d)`.
                    match row.len() {
                        2 => {
                            let doc = to_document(&row[1])?;
                            rows.push(vec![row[0].clone(), PolyValue::Integer(0), doc]);
                        }
                        3 => {
                            let doc = to_document(&row[2])?;
                            rows.push(vec![row[0].clone(), row[1].clone(), doc]);
                        }
                        _ => {
                            return Err(DbError::Execution(
                                "document transform expects (id, d) or (_eid, _vid, d) rows"
                                    .into(),
                            ))
                        }
                    }
                }
                Ok(RowSet::new(plan.row_type().clone(), rows))
            }
            crate::common::DataModel::Graph => self.execute_graph_transform(plan),
            crate::common::DataModel::Relational => self.execute(plan.input(0)),
        }
    }

    /// Composes the four relational scans of a delegated graph (nodes, node
    /// properties, edges, edge properties) into graph element rows. The
    /// part layouts are fixed by the scan delegate: nodes `(id, label)`,
    /// node properties `(node_id, key, value)`, edges
    /// `(id, source, target, label)`, edge properties
    /// `(edge_id, key, value)`.
    fn execute_graph_transform(&self, plan: &AlgNode) -> Result<RowSet> {
        if plan.inputs().len() != 4 {
            return Err(DbError::Execution(
                "graph transform expects four relational inputs".into(),
            ));
        }
        let nodes = self.execute(plan.input(0))?;
        let node_props = self.execute(plan.input(1))?;
        let edges = self.execute(plan.input(2))?;
        let edge_props = self.execute(plan.input(3))?;

        let collect_props = |rows: &RowSet, owner: i64| -> BTreeMap<String, PolyValue> {
            rows.rows
                .iter()
                .filter(|r| r.first().and_then(PolyValue::as_integer) == Some(owner))
                .filter_map(|r| {
                    let key = r.get(1)?.as_text()?.to_string();
                    Some((key, r.get(2).cloned().unwrap_or(PolyValue::Null)))
                })
                .collect()
        };

        let mut rows = Vec::new();
        for node in &nodes.rows {
            let id = node
                .first()
                .and_then(PolyValue::as_integer)
                .ok_or_else(|| DbError::Execution("node row without id".into()))?;
            let mut element = BTreeMap::new();
            element.insert("kind".to_string(), PolyValue::Text("NODE".into()));
            element.insert(
                "label".to_string(),
                node.get(1).cloned().unwrap_or(PolyValue::Null),
            );
            element.insert(
                "properties".to_string(),
                PolyValue::Document(collect_props(&node_props, id)),
            );
            rows.push(vec![
                PolyValue::Integer(id),
                PolyValue::Integer(0),
                PolyValue::Document(element),
            ]);
        }
        for edge in &edges.rows {
            let id = edge
                .first()
                .and_then(PolyValue::as_integer)
                .ok_or_else(|| DbError::Execution("edge row without id".into()))?;
            let mut element = BTreeMap::new();
            element.insert("kind".to_string(), PolyValue::Text("EDGE".into()));
            element.insert(
                "source".to_string(),
                edge.get(1).cloned().unwrap_or(PolyValue::Null),
            );
            element.insert(
                "target".to_string(),
                edge.get(2).cloned().unwrap_or(PolyValue::Null),
            );
            element.insert(
                "label".to_string(),
                edge.get(3).cloned().unwrap_or(PolyValue::Null),
            );
            element.insert(
                "properties".to_string(),
                PolyValue::Document(collect_props(&edge_props, id)),
            );
            rows.push(vec![
                PolyValue::Integer(id),
                PolyValue::Integer(0),
                PolyValue::Document(element),
            ]);
        }
        Ok(RowSet::new(plan.row_type().clone(), rows))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn versioned_to_row(row: VersionedRow) -> Vec<PolyValue> {
    let mut out = vec![PolyValue::Integer(row.eid), PolyValue::Integer(row.vid)];
    out.extend(row.values);
    out
}

fn plan_update_exprs(plan: &AlgNode) -> Result<Vec<(String, RexNode)>> {
    match plan.op() {
        AlgOperator::Modify {
            update_targets,
            update_sources,
            ..
        } => Ok(update_targets
            .iter()
            .cloned()
            .zip(update_sources.iter().cloned())
            .collect()),
        _ => Err(DbError::internal("not a modify node")),
    }
}

fn to_document(value: &PolyValue) -> Result<PolyValue> {
    match value {
        PolyValue::Document(_) => Ok(value.clone()),
        PolyValue::Text(json) => {
            let parsed: PolyValue = serde_json::from_str(json)
                .map_err(|e| DbError::Execution(format!("payload is not a document: {}", e)))?;
            Ok(parsed)
        }
        _ => Err(DbError::Execution(
            "payload is neither a document nor serialized JSON".into(),
        )),
    }
}

/// Normalizes a user node/edge document into the stored graph element shape:
/// `kind`, `label`, `properties`, and for edges `source`/`target`.
fn wrap_graph_element(doc: &PolyValue, kind: MatchKind) -> Result<PolyValue> {
    let map = match doc {
        PolyValue::Document(map) => map.clone(),
        _ => {
            return Err(DbError::Execution(
                "graph values must be documents".into(),
            ))
        }
    };
    let mut element = BTreeMap::new();
    let mut properties = BTreeMap::new();
    element.insert(
        "kind".to_string(),
        PolyValue::Text(kind.tag().to_string()),
    );
    for (key, value) in map {
        match key.as_str() {
            "label" | "source" | "target" => {
                element.insert(key, value);
            }
            _ => {
                properties.insert(key, value);
            }
        }
    }
    element.insert("properties".to_string(), PolyValue::Document(properties));
    Ok(PolyValue::Document(element))
}

fn graph_element_matches(value: &PolyValue, kind: MatchKind, labels: &[String]) -> bool {
    let map = match value {
        PolyValue::Document(map) => map,
        _ => return false,
    };
    if map.get("kind").and_then(|k| k.as_text()) != Some(kind.tag()) {
        return false;
    }
    if labels.is_empty() {
        return true;
    }
    match map.get("label").and_then(|l| l.as_text()) {
        Some(label) => labels.iter().any(|l| l == label),
        None => false,
    }
}

fn resolve_unwind_field(row_type: &AlgRowType, field: &str) -> Result<usize> {
    // Accept both a bare column name and a `col.path` spelling; unwinding a
    // nested path operates on the column that holds it.
    let column = field.split('.').next().unwrap_or(field);
    row_type
        .field_index(column)
        .ok_or_else(|| DbError::Execution(format!("unknown unwind field '{}'", field)))
}

fn row_key(row: &[PolyValue]) -> String {
    let mut key = String::new();
    for value in row {
        key.push_str(&value.to_string());
        key.push('\u{1f}');
    }
    key
}

fn dedup_rows(rows: &mut Vec<Vec<PolyValue>>) {
    let mut seen = std::collections::HashSet::new();
    rows.retain(|row| seen.insert(row_key(row)));
}

fn sort_rows(rows: &mut [Vec<PolyValue>], collation: &[FieldCollation]) {
    rows.sort_by(|a, b| {
        for c in collation {
            let ord = a[c.field].compare(&b[c.field]);
            let ord = if c.descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn aggregate(call: &AggregateCall, rows: &[Vec<PolyValue>]) -> Result<PolyValue> {
    let values = |rows: &[Vec<PolyValue>]| -> Vec<PolyValue> {
        match call.field {
            Some(index) => rows
                .iter()
                .map(|r| r[index].clone())
                .filter(|v| !v.is_null())
                .collect(),
            None => Vec::new(),
        }
    };
    Ok(match call.function {
        AggFunction::Count => match call.field {
            Some(_) => PolyValue::Integer(values(rows).len() as i64),
            None => PolyValue::Integer(rows.len() as i64),
        },
        AggFunction::Sum => numeric_fold(&values(rows), 0.0, |acc, v| acc + v)?,
        AggFunction::Min => values(rows)
            .into_iter()
            .min_by(|a, b| a.compare(b))
            .unwrap_or(PolyValue::Null),
        AggFunction::Max => values(rows)
            .into_iter()
            .max_by(|a, b| a.compare(b))
            .unwrap_or(PolyValue::Null),
        AggFunction::Avg => {
            let values = values(rows);
            if values.is_empty() {
                PolyValue::Null
            } else {
                let count = values.len() as f64;
                match numeric_fold(&values, 0.0, |acc, v| acc + v)? {
                    PolyValue::Integer(sum) => PolyValue::Float(sum as f64 / count),
                    PolyValue::Float(sum) => PolyValue::Float(sum / count),
                    _ => PolyValue::Null,
                }
            }
        }
    })
}

fn numeric_fold(
    values: &[PolyValue],
    init: f64,
    fold: impl Fn(f64, f64) -> f64,
) -> Result<PolyValue> {
    let mut acc = init;
    let mut all_integers = true;
    for value in values {
        let v = match value {
            PolyValue::Integer(v) => *v as f64,
            PolyValue::Float(v) => {
                all_integers = false;
                *v
            }
            other => {
                return Err(DbError::Execution(format!(
                    "cannot aggregate non-numeric value {}",
                    other
                )))
            }
        };
        acc = fold(acc, v);
    }
    if values.is_empty() {
        return Ok(PolyValue::Null);
    }
    if all_integers {
        Ok(PolyValue::Integer(acc as i64))
    } else {
        Ok(PolyValue::Float(acc))
    }
}

// ============================================================================
// Rex evaluation
// ============================================================================

/// Evaluates an expression against one row.
pub fn eval(expr: &RexNode, row: &[PolyValue], row_type: &AlgRowType) -> Result<PolyValue> {
    match expr {
        RexNode::Literal(value) => Ok(value.clone()),
        RexNode::Field(index) => row
            .get(*index)
            .cloned()
            .ok_or_else(|| DbError::Execution(format!("field #{} out of range", index))),
        RexNode::NamedField(path) => {
            let (column, rest) = match path.split_once('.') {
                Some((column, rest)) => (column, Some(rest)),
                None => (path.as_str(), None),
            };
            let index = row_type
                .field_index(column)
                .ok_or_else(|| DbError::Execution(format!("unknown field '{}'", column)))?;
            let value = &row[index];
            match rest {
                None => Ok(value.clone()),
                Some(rest) => Ok(value.get_path(rest).cloned().unwrap_or(PolyValue::Null)),
            }
        }
        RexNode::Call { op, operands } => eval_call(*op, operands, row, row_type),
    }
}

fn eval_call(
    op: RexOp,
    operands: &[RexNode],
    row: &[PolyValue],
    row_type: &AlgRowType,
) -> Result<PolyValue> {
    use std::cmp::Ordering;

    match op {
        RexOp::And => {
            for operand in operands {
                if eval(operand, row, row_type)? != PolyValue::Boolean(true) {
                    return Ok(PolyValue::Boolean(false));
                }
            }
            Ok(PolyValue::Boolean(true))
        }
        RexOp::Or => {
            for operand in operands {
                if eval(operand, row, row_type)? == PolyValue::Boolean(true) {
                    return Ok(PolyValue::Boolean(true));
                }
            }
            Ok(PolyValue::Boolean(false))
        }
        RexOp::Not => {
            let value = eval(&operands[0], row, row_type)?;
            Ok(PolyValue::Boolean(value != PolyValue::Boolean(true)))
        }
        RexOp::Eq | RexOp::NotEq | RexOp::Lt | RexOp::LtEq | RexOp::Gt | RexOp::GtEq => {
            let left = eval(&operands[0], row, row_type)?;
            let right = eval(&operands[1], row, row_type)?;
            // Comparisons against NULL never hold.
            if left.is_null() || right.is_null() {
                return Ok(PolyValue::Boolean(false));
            }
            let ord = left.compare(&right);
            let result = match op {
                RexOp::Eq => ord == Ordering::Equal,
                RexOp::NotEq => ord != Ordering::Equal,
                RexOp::Lt => ord == Ordering::Less,
                RexOp::LtEq => ord != Ordering::Greater,
                RexOp::Gt => ord == Ordering::Greater,
                RexOp::GtEq => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(PolyValue::Boolean(result))
        }
        RexOp::Plus | RexOp::Minus | RexOp::Times | RexOp::Divide => {
            let left = eval(&operands[0], row, row_type)?;
            let right = eval(&operands[1], row, row_type)?;
            arith(op, &left, &right)
        }
        RexOp::SetField => {
            let doc = eval(&operands[0], row, row_type)?;
            let key = eval(&operands[1], row, row_type)?;
            let value = eval(&operands[2], row, row_type)?;
            let key = key
                .as_text()
                .ok_or_else(|| DbError::Execution("SET_FIELD key must be text".into()))?
                .to_string();
            match doc {
                PolyValue::Document(mut map) => {
                    map.insert(key, value);
                    Ok(PolyValue::Document(map))
                }
                _ => Err(DbError::Execution("SET_FIELD target must be a document".into())),
            }
        }
        RexOp::Visible => Err(DbError::internal(
            "the visibility operator is a row-set predicate and cannot be evaluated per row",
        )),
    }
}

fn arith(op: RexOp, left: &PolyValue, right: &PolyValue) -> Result<PolyValue> {
    let as_f64 = |v: &PolyValue| -> Option<(f64, bool)> {
        match v {
            PolyValue::Integer(v) => Some((*v as f64, true)),
            PolyValue::Float(v) => Some((*v, false)),
            _ => None,
        }
    };
    let ((l, li), (r, ri)) = match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(DbError::Execution(format!(
                "cannot apply {} to {} and {}",
                op.tag(),
                left,
                right
            )))
        }
    };
    let value = match op {
        RexOp::Plus => l + r,
        RexOp::Minus => l - r,
        RexOp::Times => l * r,
        RexOp::Divide => {
            if r == 0.0 {
                return Err(DbError::Execution("division by zero".into()));
            }
            l / r
        }
        _ => unreachable!(),
    };
    if li && ri && op != RexOp::Divide {
        Ok(PolyValue::Integer(value as i64))
    } else {
        Ok(PolyValue::Float(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::types::{AlgField, PolyType};

    fn row_type() -> AlgRowType {
        AlgRowType::new(vec![
            AlgField::new("x", PolyType::Integer),
            AlgField::new("d", PolyType::Document),
        ])
    }

    #[test]
    fn test_eval_comparison_and_boolean() {
        let row = vec![PolyValue::Integer(5), PolyValue::Null];
        let expr = RexNode::and(vec![
            RexNode::call(RexOp::Gt, vec![RexNode::Field(0), RexNode::literal(3)]),
            RexNode::call(RexOp::Lt, vec![RexNode::Field(0), RexNode::literal(10)]),
        ]);
        assert_eq!(
            eval(&expr, &row, &row_type()).unwrap(),
            PolyValue::Boolean(true)
        );
    }

    #[test]
    fn test_eval_named_field_path() {
        let doc = PolyValue::document([("a", PolyValue::Integer(7))]);
        let row = vec![PolyValue::Integer(1), doc];
        let expr = RexNode::NamedField("d.a".into());
        assert_eq!(eval(&expr, &row, &row_type()).unwrap(), PolyValue::Integer(7));
        let missing = RexNode::NamedField("d.zz".into());
        assert_eq!(eval(&missing, &row, &row_type()).unwrap(), PolyValue::Null);
    }

    #[test]
    fn test_eval_set_field() {
        let doc = PolyValue::document([("a", PolyValue::Integer(1))]);
        let row = vec![PolyValue::Integer(1), doc];
        let expr = RexNode::call(
            RexOp::SetField,
            vec![
                RexNode::NamedField("d".into()),
                RexNode::literal("a"),
                RexNode::literal(2),
            ],
        );
        let result = eval(&expr, &row, &row_type()).unwrap();
        assert_eq!(result.get_path("a"), Some(&PolyValue::Integer(2)));
    }

    #[test]
    fn test_null_comparison_never_holds() {
        let row = vec![PolyValue::Null, PolyValue::Null];
        let expr = RexNode::eq(RexNode::Field(0), RexNode::literal(1));
        assert_eq!(
            eval(&expr, &row, &row_type()).unwrap(),
            PolyValue::Boolean(false)
        );
    }

    #[test]
    fn test_arithmetic() {
        let row = vec![PolyValue::Integer(6), PolyValue::Null];
        let expr = RexNode::call(RexOp::Times, vec![RexNode::Field(0), RexNode::literal(7)]);
        assert_eq!(eval(&expr, &row, &row_type()).unwrap(), PolyValue::Integer(42));

        let division = RexNode::call(
            RexOp::Divide,
            vec![RexNode::Field(0), RexNode::literal(0)],
        );
        assert!(eval(&division, &row, &row_type()).is_err());
    }

    #[test]
    fn test_wrap_graph_element_splits_properties() {
        let node = PolyValue::document([
            ("label", PolyValue::Text("person".into())),
            ("name", PolyValue::Text("ada".into())),
        ]);
        let wrapped = wrap_graph_element(&node, MatchKind::Node).unwrap();
        assert_eq!(
            wrapped.get_path("kind"),
            Some(&PolyValue::Text("NODE".into()))
        );
        assert_eq!(
            wrapped.get_path("properties.name"),
            Some(&PolyValue::Text("ada".into()))
        );
        assert!(graph_element_matches(&wrapped, MatchKind::Node, &["person".into()]));
        assert!(!graph_element_matches(&wrapped, MatchKind::Edge, &[]));
    }
}
