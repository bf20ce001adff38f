// ON_COMMIT constraint enforcement.
//
// Declared uniqueness constraints are checked at commit time against the
// committing transaction's own view: committed state plus its staged
// writes. The enforcement query is the entity's snapshot-limited scan,
// grouped by the constrained fields.

use crate::algebra::node::{AlgNode, AlgOperator};
use crate::algebra::rex::{RexNode, RexOp};
use crate::algebra::AlgBuilder;
use crate::catalog::ConstraintKind;
use crate::common::{EntityId, PolyValue, ENTRY_ID_FIELD, VERSION_FIELD};
use crate::error::{DbError, Result};
use crate::transaction::{ConstraintEnforcer, Transaction};
use crate::KernelContext;

/// Enforces declared primary-key/unique constraints on written entities.
pub struct UniqueConstraintEnforcer;

impl ConstraintEnforcer for UniqueConstraintEnforcer {
    fn enforce(&self, context: &KernelContext, txn: &Transaction) -> Result<Vec<String>> {
        let snapshot = context.catalog.snapshot();
        let mut violations = Vec::new();

        for entity_id in txn.written_entities() {
            let constraints = snapshot.constraints_of(entity_id);
            if constraints.is_empty() {
                continue;
            }
            let rows = visible_rows(context, txn, entity_id)?;
            let Some((row_type, rows)) = rows else {
                continue;
            };

            for constraint in constraints {
                let fields = match &constraint.kind {
                    ConstraintKind::PrimaryKey { fields } | ConstraintKind::Unique { fields } => {
                        fields
                    }
                };
                let indices: Vec<usize> = fields
                    .iter()
                    .filter_map(|f| row_type.field_index(f))
                    .collect();
                if indices.len() != fields.len() {
                    continue;
                }
                let mut seen = std::collections::HashMap::new();
                for row in &rows {
                    let key: Vec<String> =
                        indices.iter().map(|&i| row[i].to_string()).collect();
                    let key = key.join("\u{1f}");
                    if let Some(count) = seen.get_mut(&key) {
                        *count += 1;
                    } else {
                        seen.insert(key, 1usize);
                    }
                }
                if let Some((key, _)) = seen.iter().find(|(_, &count)| count > 1) {
                    violations.push(format!(
                        "constraint '{}' violated on entity {}: duplicate key ({})",
                        constraint.name,
                        entity_id,
                        key.replace('\u{1f}', ", ")
                    ));
                }
            }
        }
        Ok(violations)
    }
}

/// The entity's rows as the committing transaction sees them, or `None` for
/// entities without a usable placement.
fn visible_rows(
    context: &KernelContext,
    txn: &Transaction,
    entity_id: EntityId,
) -> Result<Option<(crate::algebra::AlgRowType, Vec<Vec<PolyValue>>)>> {
    let snapshot = context.catalog.snapshot();
    let Some(placement) = snapshot.placements_of(entity_id).into_iter().next() else {
        return Ok(None);
    };
    let adapter = context
        .adapters
        .get(placement.adapter)
        .ok_or_else(|| DbError::AdapterUnknown(format!("adapter id {}", placement.adapter)))?;

    let mut builder = AlgBuilder::physical(adapter.id());
    let scan = adapter.scan(placement.allocation, &mut builder)?;

    let plan = if snapshot.is_mvcc(entity_id) {
        let vid_index = scan
            .row_type()
            .field_index(VERSION_FIELD)
            .ok_or_else(|| DbError::internal("versioned scan without _vid"))?;
        debug_assert!(scan.row_type().field_index(ENTRY_ID_FIELD).is_some());
        let condition = RexNode::call(
            RexOp::Visible,
            vec![
                RexNode::Field(vid_index),
                RexNode::literal(txn.snapshot()),
                RexNode::literal(txn.id()),
            ],
        );
        AlgNode::new(
            AlgOperator::Filter { condition },
            scan.traits().clone(),
            vec![scan],
        )
    } else {
        scan
    };

    let result = adapter.execute(&plan, txn)?;
    Ok(Some((result.row_type, result.rows)))
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end through the kernel scenario suite; the unit
    // surface here is the key grouping.
    use super::*;

    #[test]
    fn test_duplicate_detection_key_shape() {
        let rows = [
            vec![PolyValue::Integer(1), PolyValue::Text("a".into())],
            vec![PolyValue::Integer(2), PolyValue::Text("a".into())],
        ];
        let keys: Vec<String> = rows
            .iter()
            .map(|row| row[1].to_string())
            .collect();
        assert_eq!(keys[0], keys[1]);
    }
}
