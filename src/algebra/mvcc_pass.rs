// MVCC rewrite pass.
//
// A single shuttle walks the tree bottom-up under the current transaction
// and turns a user plan into a versioned plan:
//
// - scans of MVCC entities are limited to the transaction's snapshot,
// - inserts get an identifier operator allocating `_eid` and staging
//   `_vid = -txn`,
// - relational updates become inserts of a join between the updated
//   projection (minus `_vid`, keeping `_eid`) and a one-row values node
//   producing the staged version,
// - document/graph updates keep `_eid` through a projection and go through
//   the identifier operator for the fresh `_vid`,
// - any user-supplied `_eid`/`_vid` is rejected before execution.
//
// The snapshot limit is a deferred modification: the scan visit registers
// it, the parent visit wraps the scan in the visibility filter. Deferrals
// that survive to the root mean the pass is broken, not the plan.

use std::sync::Arc;

use crate::catalog::CatalogSnapshot;
use crate::common::{
    is_reserved_field, PolyValue, TransactionId, VersionId, ENTRY_ID_FIELD, VERSION_FIELD,
};
use crate::error::{DbError, Result};
use crate::transaction::Transaction;

use super::node::{AlgNode, AlgOperator, EntityRef, JoinKind, ModifyOperation};
use super::rex::{RexNode, RexOp};
use super::types::{AlgField, AlgRowType, PolyType};

/// A modification scheduled by a child visit for its parent to apply.
enum PendingModification {
    /// Wrap this scan in `filter(visible(_vid, snapshot))`.
    LimitScanToSnapshot { scan: Arc<AlgNode> },
}

/// Bottom-up rewriting shuttle for one statement of one transaction.
pub struct MvccShuttle<'a> {
    txn_id: TransactionId,
    snapshot: VersionId,
    catalog: &'a CatalogSnapshot,
    pending: Vec<PendingModification>,
    /// Name of the reserved key found in a values subtree, if any.
    contains_identifier_key: Option<String>,
}

impl<'a> MvccShuttle<'a> {
    pub fn new(txn: &Transaction, catalog: &'a CatalogSnapshot) -> Self {
        Self {
            txn_id: txn.id(),
            snapshot: txn.snapshot(),
            catalog,
            pending: Vec::new(),
            contains_identifier_key: None,
        }
    }

    /// Rewrites a full statement tree.
    pub fn rewrite(&mut self, root: &Arc<AlgNode>) -> Result<Arc<AlgNode>> {
        let rewritten = self.visit(root)?;
        let rewritten = self.resolve_child_pending(rewritten)?;
        if !self.pending.is_empty() {
            return Err(DbError::internal(format!(
                "{} pending modification(s) left unresolved at plan root",
                self.pending.len()
            )));
        }
        Ok(rewritten)
    }

    fn visit(&mut self, node: &Arc<AlgNode>) -> Result<Arc<AlgNode>> {
        // Children first; each child's deferral is resolved by this visit.
        let mut inputs = Vec::with_capacity(node.inputs().len());
        for child in node.inputs() {
            let rewritten = self.visit(child)?;
            inputs.push(self.resolve_child_pending(rewritten)?);
        }

        match node.op() {
            AlgOperator::Scan { entity, .. } => {
                let scan = node.copy_with(inputs);
                if self.catalog.is_mvcc(entity.id) {
                    self.pending.push(PendingModification::LimitScanToSnapshot {
                        scan: Arc::clone(&scan),
                    });
                }
                Ok(scan)
            }
            AlgOperator::Values { row_type, .. } => {
                for field in &row_type.fields {
                    if is_reserved_field(&field.name) {
                        self.contains_identifier_key = Some(field.name.clone());
                    }
                }
                Ok(node.copy_with(inputs))
            }
            AlgOperator::DocumentValues { documents } => {
                for doc in documents {
                    if let Some(key) = doc.find_reserved_field() {
                        self.contains_identifier_key = Some(key.to_string());
                    }
                }
                Ok(node.copy_with(inputs))
            }
            AlgOperator::LpgValues { nodes, edges } => {
                for value in nodes.iter().chain(edges) {
                    if let Some(key) = value.find_reserved_field() {
                        self.contains_identifier_key = Some(key.to_string());
                    }
                }
                Ok(node.copy_with(inputs))
            }
            AlgOperator::Modify {
                entity,
                operation,
                update_targets,
                update_sources,
            } => self.visit_modify(
                node,
                inputs,
                entity.clone(),
                *operation,
                update_targets.clone(),
                update_sources.clone(),
            ),
            _ => Ok(node.copy_with(inputs)),
        }
    }

    /// Applies scheduled scan limits that belong to `child` itself. Limits
    /// of scans deeper in the subtree were resolved by their own parents.
    fn resolve_child_pending(&mut self, child: Arc<AlgNode>) -> Result<Arc<AlgNode>> {
        let mut matched = false;
        self.pending.retain(|pending| {
            let PendingModification::LimitScanToSnapshot { scan } = pending;
            if Arc::ptr_eq(scan, &child) {
                matched = true;
                false
            } else {
                true
            }
        });
        if !matched {
            return Ok(child);
        }

        let vid_index = child
            .row_type()
            .field_index(VERSION_FIELD)
            .ok_or_else(|| {
                DbError::internal("versioned scan without a _vid field")
            })?;
        let condition = RexNode::call(
            RexOp::Visible,
            vec![
                RexNode::Field(vid_index),
                RexNode::literal(self.snapshot),
                RexNode::literal(self.txn_id),
            ],
        );
        Ok(AlgNode::new(
            AlgOperator::Filter { condition },
            child.traits().clone(),
            vec![child],
        ))
    }

    fn visit_modify(
        &mut self,
        node: &Arc<AlgNode>,
        inputs: Vec<Arc<AlgNode>>,
        entity: EntityRef,
        operation: ModifyOperation,
        update_targets: Vec<String>,
        update_sources: Vec<RexNode>,
    ) -> Result<Arc<AlgNode>> {
        if let Some(key) = self.contains_identifier_key.take() {
            return Err(DbError::illegal_field(key));
        }
        for target in &update_targets {
            if is_reserved_field(target) {
                return Err(DbError::illegal_field(target.clone()));
            }
        }

        if !self.catalog.is_mvcc(entity.id) {
            return Ok(node.copy_with(inputs));
        }

        let input = inputs.into_iter().next().ok_or_else(|| {
            DbError::internal("modify without an input")
        })?;

        match operation {
            ModifyOperation::Insert => {
                let identifier = AlgNode::new(
                    AlgOperator::Identifier {
                        entity: entity.clone(),
                    },
                    input.traits().clone(),
                    vec![input],
                );
                Ok(AlgNode::new(
                    AlgOperator::Modify {
                        entity,
                        operation: ModifyOperation::Insert,
                        update_targets: vec![],
                        update_sources: vec![],
                    },
                    node.traits().clone(),
                    vec![identifier],
                ))
            }
            ModifyOperation::Update => match node.model() {
                crate::common::DataModel::Relational => self.rewrite_relational_update(
                    node,
                    input,
                    entity,
                    update_targets,
                    update_sources,
                ),
                _ => self.rewrite_versioned_update(node, input, entity, update_targets, update_sources),
            },
            ModifyOperation::Delete => Ok(node.copy_with(vec![input])),
        }
    }

    /// `UPDATE t SET c = e` becomes an insert of
    /// `project(_eid, updated columns) x values(-txn AS _vid)`, reordered to
    /// the stored column layout. The stable `_eid` rides through the
    /// projection; only `_vid` is fresh.
    fn rewrite_relational_update(
        &mut self,
        node: &Arc<AlgNode>,
        input: Arc<AlgNode>,
        entity: EntityRef,
        update_targets: Vec<String>,
        update_sources: Vec<RexNode>,
    ) -> Result<Arc<AlgNode>> {
        let catalog_entity = self.catalog.entity(entity.id).ok_or_else(|| {
            DbError::Catalog(format!("entity '{}' not in catalog", entity.name))
        })?;
        let input_type = input.row_type().clone();
        let eid_index = input_type.field_index(ENTRY_ID_FIELD).ok_or_else(|| {
            DbError::internal("update input lost the _eid field")
        })?;

        // Old projection minus _vid, with the SET expressions applied.
        let mut exprs = vec![RexNode::Field(eid_index)];
        let mut names = vec![ENTRY_ID_FIELD.to_string()];
        for column in &catalog_entity.columns {
            let expr = match update_targets.iter().position(|t| t == column) {
                Some(at) => update_sources[at].clone(),
                None => {
                    let index = input_type.field_index(column).ok_or_else(|| {
                        DbError::Algebra(format!("column '{}' missing from update input", column))
                    })?;
                    RexNode::Field(index)
                }
            };
            exprs.push(expr);
            names.push(column.clone());
        }
        let projected = AlgNode::new(
            AlgOperator::Project { exprs, names },
            input.traits().clone(),
            vec![input],
        );

        // Single-row values producing the staged version number.
        let version_values = AlgNode::new(
            AlgOperator::Values {
                row_type: AlgRowType::new(vec![AlgField::new(VERSION_FIELD, PolyType::Integer)]),
                tuples: vec![vec![PolyValue::Integer(-self.txn_id)]],
            },
            projected.traits().clone(),
            vec![],
        );
        let joined = AlgNode::new(
            AlgOperator::Join {
                kind: JoinKind::Inner,
                condition: RexNode::literal(true),
            },
            projected.traits().clone(),
            vec![Arc::clone(&projected), version_values],
        );

        // Reorder to the stored layout: _eid, _vid, then the columns.
        let joined_type = joined.row_type().clone();
        let mut exprs = vec![
            RexNode::Field(0),
            RexNode::Field(joined_type.field_count() - 1),
        ];
        let mut names = vec![ENTRY_ID_FIELD.to_string(), VERSION_FIELD.to_string()];
        for column in &catalog_entity.columns {
            let index = joined_type.field_index(column).ok_or_else(|| {
                DbError::internal(format!("column '{}' lost in update join", column))
            })?;
            exprs.push(RexNode::Field(index));
            names.push(column.clone());
        }
        let reordered = AlgNode::new(
            AlgOperator::Project { exprs, names },
            joined.traits().clone(),
            vec![joined],
        );

        Ok(AlgNode::new(
            AlgOperator::Modify {
                entity,
                operation: ModifyOperation::Insert,
                update_targets: vec![],
                update_sources: vec![],
            },
            node.traits().clone(),
            vec![reordered],
        ))
    }

    /// Document and graph updates: keep `_eid` through a projection, apply
    /// the SET expressions to the payload document, and let the identifier
    /// operator stamp the staged `_vid`.
    fn rewrite_versioned_update(
        &mut self,
        node: &Arc<AlgNode>,
        input: Arc<AlgNode>,
        entity: EntityRef,
        update_targets: Vec<String>,
        update_sources: Vec<RexNode>,
    ) -> Result<Arc<AlgNode>> {
        let input_type = input.row_type().clone();
        let eid_index = input_type.field_index(ENTRY_ID_FIELD).ok_or_else(|| {
            DbError::internal("update input lost the _eid field")
        })?;
        let payload_name = match node.model() {
            crate::common::DataModel::Graph => "g",
            _ => "d",
        };
        let payload_index = input_type.field_index(payload_name).ok_or_else(|| {
            DbError::internal(format!("update input lost the '{}' payload", payload_name))
        })?;

        let mut payload = RexNode::Field(payload_index);
        for (target, source) in update_targets.iter().zip(update_sources) {
            payload = RexNode::call(
                RexOp::SetField,
                vec![
                    payload,
                    RexNode::Literal(PolyValue::Text(target.clone())),
                    source,
                ],
            );
        }

        let projected = AlgNode::new(
            AlgOperator::Project {
                exprs: vec![RexNode::Field(eid_index), payload],
                names: vec![ENTRY_ID_FIELD.to_string(), payload_name.to_string()],
            },
            input.traits().clone(),
            vec![input],
        );
        let identifier = AlgNode::new(
            AlgOperator::Identifier {
                entity: entity.clone(),
            },
            projected.traits().clone(),
            vec![projected],
        );
        Ok(AlgNode::new(
            AlgOperator::Modify {
                entity,
                operation: ModifyOperation::Insert,
                update_targets: vec![],
                update_sources: vec![],
            },
            node.traits().clone(),
            vec![identifier],
        ))
    }
}

/// Convenience entry point: rewrites `root` for `txn`.
pub fn rewrite_for_transaction(
    txn: &Transaction,
    catalog: &CatalogSnapshot,
    root: &Arc<AlgNode>,
) -> Result<Arc<AlgNode>> {
    MvccShuttle::new(txn, catalog).rewrite(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::builder::AlgBuilder;
    use crate::catalog::Catalog;
    use crate::common::{DataModel, EntityType};
    use crate::transaction::{TransactionFlavor, Xid};

    fn fixture() -> (Catalog, EntityRef, Transaction) {
        let catalog = Catalog::new();
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
        let entity = EntityRef {
            id: table,
            namespace: ns,
            name: "t".into(),
        };
        let txn = Transaction::new(7, 7, Xid::new(0, 7), "alice", ns, TransactionFlavor::Interactive);
        (catalog, entity, txn)
    }

    fn scan_plan(entity: &EntityRef) -> Arc<AlgNode> {
        AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity.clone(),
                AlgRowType::versioned_relational(["x"]),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_scan_wrapped_in_snapshot_filter() {
        let (catalog, entity, txn) = fixture();
        let plan = scan_plan(&entity);
        let rewritten = rewrite_for_transaction(&txn, &catalog.snapshot(), &plan).unwrap();

        assert_eq!(rewritten.op().tag(), "FILTER");
        match rewritten.op() {
            AlgOperator::Filter { condition } => {
                assert_eq!(condition.to_string(), "VISIBLE(#1, 7, 7)");
            }
            _ => unreachable!(),
        }
        assert_eq!(rewritten.input(0).op().tag(), "SCAN");
    }

    #[test]
    fn test_plain_namespace_scan_untouched() {
        let catalog = Catalog::new();
        let ns = catalog
            .add_namespace("archive", DataModel::Relational, false)
            .unwrap();
        let table = catalog
            .add_entity(ns, "old", DataModel::Relational, EntityType::Entity, vec!["x".into()])
            .unwrap();
        let entity = EntityRef {
            id: table,
            namespace: ns,
            name: "old".into(),
        };
        let txn = Transaction::new(3, 3, Xid::new(0, 3), "bob", ns, TransactionFlavor::Interactive);
        let plan = scan_plan(&entity);
        let rewritten = rewrite_for_transaction(&txn, &catalog.snapshot(), &plan).unwrap();
        assert_eq!(rewritten.op().tag(), "SCAN");
    }

    #[test]
    fn test_insert_gets_identifier() {
        let (catalog, entity, txn) = fixture();
        let plan = AlgBuilder::logical()
            .values(
                AlgRowType::new(vec![AlgField::new("x", PolyType::Integer)]),
                vec![vec![PolyValue::Integer(1)]],
            )
            .modify(entity.clone(), ModifyOperation::Insert, vec![], vec![])
            .unwrap()
            .build()
            .unwrap();

        let rewritten = rewrite_for_transaction(&txn, &catalog.snapshot(), &plan).unwrap();
        assert_eq!(rewritten.op().tag(), "MODIFY");
        assert_eq!(rewritten.input(0).op().tag(), "IDENTIFIER");
        assert_eq!(rewritten.input(0).input(0).op().tag(), "VALUES");
    }

    #[test]
    fn test_relational_update_becomes_insert_of_join() {
        let (catalog, entity, txn) = fixture();
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity.clone(),
                AlgRowType::versioned_relational(["x"]),
            )
            .modify(
                entity.clone(),
                ModifyOperation::Update,
                vec!["x".into()],
                vec![RexNode::literal(2)],
            )
            .unwrap()
            .build()
            .unwrap();

        let rewritten = rewrite_for_transaction(&txn, &catalog.snapshot(), &plan).unwrap();
        match rewritten.op() {
            AlgOperator::Modify { operation, .. } => {
                assert_eq!(*operation, ModifyOperation::Insert)
            }
            _ => panic!("expected modify at root"),
        }
        // project(reorder) <- join <- [project(eid, cols), values(-txn)]
        let reorder = rewritten.input(0);
        assert_eq!(reorder.op().tag(), "PROJECT");
        let join = reorder.input(0);
        assert_eq!(join.op().tag(), "JOIN");
        assert_eq!(join.input(1).op().tag(), "VALUES");
        match join.input(1).op() {
            AlgOperator::Values { tuples, .. } => {
                assert_eq!(tuples[0][0], PolyValue::Integer(-7));
            }
            _ => unreachable!(),
        }
        // The scan below the projection is still snapshot-limited.
        let project = join.input(0);
        assert_eq!(project.input(0).op().tag(), "FILTER");
    }

    #[test]
    fn test_reserved_key_in_document_rejected() {
        let (catalog, entity, txn) = fixture();
        let doc = PolyValue::document([
            ("a", PolyValue::Integer(1)),
            ("_vid", PolyValue::Integer(5)),
        ]);
        let plan = AlgBuilder::logical()
            .document_values(vec![doc])
            .modify(entity, ModifyOperation::Insert, vec![], vec![])
            .unwrap()
            .build()
            .unwrap();

        let result = rewrite_for_transaction(&txn, &catalog.snapshot(), &plan);
        assert!(matches!(result, Err(DbError::IllegalField { field }) if field == "_vid"));
    }

    #[test]
    fn test_reserved_update_target_rejected() {
        let (catalog, entity, txn) = fixture();
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity.clone(),
                AlgRowType::versioned_relational(["x"]),
            )
            .modify(
                entity,
                ModifyOperation::Update,
                vec!["_eid".into()],
                vec![RexNode::literal(9)],
            )
            .unwrap()
            .build()
            .unwrap();

        let result = rewrite_for_transaction(&txn, &catalog.snapshot(), &plan);
        assert!(matches!(result, Err(DbError::IllegalField { .. })));
    }
}
