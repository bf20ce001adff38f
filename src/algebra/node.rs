// The cross-model algebra.
//
// One node type covers all three data models; the model lives in the trait
// set and the operator variant carries the parameters. Nodes are immutable
// after construction and shared via `Arc`; every transformation builds new
// nodes. Identity for memoization is the compare string, a deterministic
// structural rendering, computed lazily and cached.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::common::{
    AdapterId, DataModel, EntityId, NamespaceId, PolyValue, ENTRY_ID_FIELD, VERSION_FIELD,
};

use super::rex::RexNode;
use super::types::{AlgField, AlgRowType, PolyType};

/// Which engine a subtree is planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Convention {
    Logical,
    Physical(AdapterId),
}

impl fmt::Display for Convention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Convention::Logical => write!(f, "LOGICAL"),
            Convention::Physical(adapter) => write!(f, "PHYSICAL@{}", adapter),
        }
    }
}

/// Sort direction of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCollation {
    pub field: usize,
    pub descending: bool,
}

impl fmt::Display for FieldCollation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}{}", self.field, if self.descending { " DESC" } else { "" })
    }
}

/// Trait set of a node: model, convention, and output collation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgTraitSet {
    pub model: DataModel,
    pub convention: Convention,
    pub collation: Vec<FieldCollation>,
}

impl AlgTraitSet {
    pub fn logical(model: DataModel) -> Self {
        Self {
            model,
            convention: Convention::Logical,
            collation: Vec::new(),
        }
    }

    pub fn physical(model: DataModel, adapter: AdapterId) -> Self {
        Self {
            model,
            convention: Convention::Physical(adapter),
            collation: Vec::new(),
        }
    }

    pub fn with_collation(mut self, collation: Vec<FieldCollation>) -> Self {
        self.collation = collation;
        self
    }
}

/// Reference to a catalog entity inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    pub namespace: NamespaceId,
    pub name: String,
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.namespace, self.name, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub fn tag(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyOperation {
    Insert,
    Update,
    Delete,
}

impl ModifyOperation {
    pub fn tag(&self) -> &'static str {
        match self {
            ModifyOperation::Insert => "INSERT",
            ModifyOperation::Update => "UPDATE",
            ModifyOperation::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggFunction {
    pub fn tag(&self) -> &'static str {
        match self {
            AggFunction::Count => "COUNT",
            AggFunction::Sum => "SUM",
            AggFunction::Min => "MIN",
            AggFunction::Max => "MAX",
            AggFunction::Avg => "AVG",
        }
    }
}

/// One aggregate computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCall {
    pub function: AggFunction,
    /// Input field; `None` for `COUNT(*)`.
    pub field: Option<usize>,
    pub alias: String,
}

impl fmt::Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            Some(field) => write!(f, "{}(#{}) AS {}", self.function.tag(), field, self.alias),
            None => write!(f, "{}(*) AS {}", self.function.tag(), self.alias),
        }
    }
}

/// Graph pattern element matched by `Match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    Node,
    Edge,
}

impl MatchKind {
    pub fn tag(&self) -> &'static str {
        match self {
            MatchKind::Node => "NODE",
            MatchKind::Edge => "EDGE",
        }
    }
}

/// The closed operator set of the cross-model algebra.
#[derive(Debug, Clone, PartialEq)]
pub enum AlgOperator {
    /// Scan of an entity; the declared row type comes from the catalog (or
    /// the adapter for physical scans).
    Scan {
        entity: EntityRef,
        row_type: AlgRowType,
    },
    Project {
        exprs: Vec<RexNode>,
        names: Vec<String>,
    },
    Filter {
        condition: RexNode,
    },
    Join {
        kind: JoinKind,
        condition: RexNode,
    },
    Union {
        all: bool,
    },
    Intersect {
        all: bool,
    },
    Minus {
        all: bool,
    },
    Sort {
        collation: Vec<FieldCollation>,
        offset: Option<usize>,
        fetch: Option<usize>,
    },
    Aggregate {
        group: Vec<usize>,
        calls: Vec<AggregateCall>,
    },
    /// Relational literal rows.
    Values {
        row_type: AlgRowType,
        tuples: Vec<Vec<PolyValue>>,
    },
    /// Document literals.
    DocumentValues {
        documents: Vec<PolyValue>,
    },
    /// Graph literals: node and edge documents.
    LpgValues {
        nodes: Vec<PolyValue>,
        edges: Vec<PolyValue>,
    },
    Modify {
        entity: EntityRef,
        operation: ModifyOperation,
        update_targets: Vec<String>,
        update_sources: Vec<RexNode>,
    },
    /// Stamps `_eid` (allocating when absent) and `_vid = -txn` onto its
    /// input rows. Injected by the MVCC rewrite, never written by users.
    Identifier {
        entity: EntityRef,
    },
    /// Model boundary: re-expresses the input rows in another model.
    Transformer {
        from: DataModel,
        to: DataModel,
    },
    Match {
        kind: MatchKind,
        labels: Vec<String>,
        alias: String,
    },
    Unwind {
        field: String,
    },
}

impl AlgOperator {
    pub fn tag(&self) -> &'static str {
        match self {
            AlgOperator::Scan { .. } => "SCAN",
            AlgOperator::Project { .. } => "PROJECT",
            AlgOperator::Filter { .. } => "FILTER",
            AlgOperator::Join { .. } => "JOIN",
            AlgOperator::Union { .. } => "UNION",
            AlgOperator::Intersect { .. } => "INTERSECT",
            AlgOperator::Minus { .. } => "MINUS",
            AlgOperator::Sort { .. } => "SORT",
            AlgOperator::Aggregate { .. } => "AGGREGATE",
            AlgOperator::Values { .. } => "VALUES",
            AlgOperator::DocumentValues { .. } => "DOC_VALUES",
            AlgOperator::LpgValues { .. } => "LPG_VALUES",
            AlgOperator::Modify { .. } => "MODIFY",
            AlgOperator::Identifier { .. } => "IDENTIFIER",
            AlgOperator::Transformer { .. } => "TRANSFORMER",
            AlgOperator::Match { .. } => "MATCH",
            AlgOperator::Unwind { .. } => "UNWIND",
        }
    }
}

/// An immutable algebra node.
pub struct AlgNode {
    op: AlgOperator,
    traits: AlgTraitSet,
    inputs: Vec<Arc<AlgNode>>,
    row_type: OnceCell<AlgRowType>,
    compare_key: OnceCell<String>,
}

impl AlgNode {
    pub fn new(op: AlgOperator, traits: AlgTraitSet, inputs: Vec<Arc<AlgNode>>) -> Arc<Self> {
        Arc::new(Self {
            op,
            traits,
            inputs,
            row_type: OnceCell::new(),
            compare_key: OnceCell::new(),
        })
    }

    pub fn op(&self) -> &AlgOperator {
        &self.op
    }

    pub fn traits(&self) -> &AlgTraitSet {
        &self.traits
    }

    pub fn model(&self) -> DataModel {
        self.traits.model
    }

    pub fn convention(&self) -> Convention {
        self.traits.convention
    }

    pub fn inputs(&self) -> &[Arc<AlgNode>] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> &Arc<AlgNode> {
        &self.inputs[index]
    }

    /// Structural copy with replaced inputs.
    pub fn copy_with(&self, inputs: Vec<Arc<AlgNode>>) -> Arc<AlgNode> {
        AlgNode::new(self.op.clone(), self.traits.clone(), inputs)
    }

    /// Structural copy with a new trait set (planner rules switch the
    /// convention this way).
    pub fn copy_with_traits(&self, traits: AlgTraitSet, inputs: Vec<Arc<AlgNode>>) -> Arc<AlgNode> {
        AlgNode::new(self.op.clone(), traits, inputs)
    }

    /// The entity scanned by this subtree, if it scans exactly one.
    pub fn scanned_entity(&self) -> Option<&EntityRef> {
        if let AlgOperator::Scan { entity, .. } = &self.op {
            return Some(entity);
        }
        let mut found = None;
        for input in &self.inputs {
            if let Some(entity) = input.scanned_entity() {
                if found.is_some() {
                    return None;
                }
                found = Some(entity);
            }
        }
        found
    }

    /// Output row type, computed once.
    pub fn row_type(&self) -> &AlgRowType {
        self.row_type.get_or_init(|| self.compute_row_type())
    }

    fn compute_row_type(&self) -> AlgRowType {
        match &self.op {
            AlgOperator::Scan { row_type, .. } => row_type.clone(),
            AlgOperator::Values { row_type, .. } => row_type.clone(),
            AlgOperator::DocumentValues { .. } => {
                AlgRowType::new(vec![AlgField::new("d", PolyType::Document)])
            }
            AlgOperator::LpgValues { .. } => {
                AlgRowType::new(vec![AlgField::new("g", PolyType::Document)])
            }
            AlgOperator::Filter { .. }
            | AlgOperator::Sort { .. }
            | AlgOperator::Union { .. }
            | AlgOperator::Intersect { .. }
            | AlgOperator::Minus { .. } => self.inputs[0].row_type().clone(),
            AlgOperator::Project { exprs, names } => {
                let input_type = self.inputs[0].row_type();
                let fields = exprs
                    .iter()
                    .zip(names.iter())
                    .map(|(expr, name)| AlgField::new(name.clone(), infer_type(expr, input_type)))
                    .collect();
                AlgRowType::new(fields)
            }
            AlgOperator::Join { .. } => self.inputs[0]
                .row_type()
                .joined_with(self.inputs[1].row_type()),
            AlgOperator::Aggregate { group, calls } => {
                let input_type = self.inputs[0].row_type();
                let mut fields: Vec<AlgField> = group
                    .iter()
                    .map(|&i| input_type.fields[i].clone())
                    .collect();
                fields.extend(
                    calls
                        .iter()
                        .map(|call| AlgField::new(call.alias.clone(), PolyType::Any)),
                );
                AlgRowType::new(fields)
            }
            AlgOperator::Modify { .. } => {
                AlgRowType::new(vec![AlgField::new("rowcount", PolyType::Integer)])
            }
            AlgOperator::Identifier { .. } => {
                let input_type = self.inputs[0].row_type();
                if input_type.field_index(ENTRY_ID_FIELD) == Some(0)
                    && input_type.field_index(VERSION_FIELD) == Some(1)
                {
                    return input_type.clone();
                }
                let mut fields = vec![
                    AlgField::new(ENTRY_ID_FIELD, PolyType::Integer),
                    AlgField::new(VERSION_FIELD, PolyType::Integer),
                ];
                fields.extend(
                    input_type
                        .fields
                        .iter()
                        .filter(|f| f.name != ENTRY_ID_FIELD && f.name != VERSION_FIELD)
                        .cloned(),
                );
                AlgRowType::new(fields)
            }
            AlgOperator::Transformer { to, .. } => match to {
                DataModel::Document => AlgRowType::versioned_document(),
                DataModel::Graph => AlgRowType::versioned_graph(),
                DataModel::Relational => self.inputs[0].row_type().clone(),
            },
            AlgOperator::Match { .. } => self.inputs[0].row_type().clone(),
            AlgOperator::Unwind { field } => {
                let mut row_type = self.inputs[0].row_type().clone();
                if let Some(index) = row_type.field_index(field) {
                    row_type.fields[index].ty = PolyType::Any;
                }
                row_type
            }
        }
    }

    /// Deterministic structural key: operator, parameters, traits, and
    /// inputs. Two nodes with equal compare strings are structurally equal
    /// modulo collation normalization.
    pub fn compare_string(&self) -> &str {
        self.compare_key.get_or_init(|| {
            let mut out = String::new();
            self.render_compare(&mut out);
            out
        })
    }

    fn render_compare(&self, out: &mut String) {
        let _ = write!(out, "{}:{}:{}", self.model(), self.op.tag(), self.traits.convention);
        let _ = write!(out, "{{");
        self.render_params(out);
        let _ = write!(out, "}}(");
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            input.render_compare(out);
        }
        let _ = write!(out, ")");
    }

    fn render_params(&self, out: &mut String) {
        match &self.op {
            AlgOperator::Scan { entity, .. } => {
                let _ = write!(out, "entity={}", entity);
            }
            AlgOperator::Project { exprs, names } => {
                for (i, (expr, name)) in exprs.iter().zip(names).enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{} AS {}", expr, name);
                }
            }
            AlgOperator::Filter { condition } => {
                let _ = write!(out, "condition={}", condition);
            }
            AlgOperator::Join { kind, condition } => {
                let _ = write!(out, "kind={},condition={}", kind.tag(), condition);
            }
            AlgOperator::Union { all }
            | AlgOperator::Intersect { all }
            | AlgOperator::Minus { all } => {
                let _ = write!(out, "all={}", all);
            }
            AlgOperator::Sort {
                collation,
                offset,
                fetch,
            } => {
                for (i, c) in collation.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}", c);
                }
                if let Some(offset) = offset {
                    let _ = write!(out, ",offset={}", offset);
                }
                if let Some(fetch) = fetch {
                    let _ = write!(out, ",fetch={}", fetch);
                }
            }
            AlgOperator::Aggregate { group, calls } => {
                let _ = write!(out, "group={:?},calls=[", group);
                for (i, call) in calls.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}", call);
                }
                out.push(']');
            }
            AlgOperator::Values { tuples, .. } => {
                let _ = write!(out, "tuples={}", tuples.len());
                for row in tuples {
                    out.push(';');
                    for (i, value) in row.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        let _ = write!(out, "{}", value);
                    }
                }
            }
            AlgOperator::DocumentValues { documents } => {
                for (i, doc) in documents.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}", doc);
                }
            }
            AlgOperator::LpgValues { nodes, edges } => {
                let _ = write!(out, "nodes={},edges={}", nodes.len(), edges.len());
                for value in nodes.iter().chain(edges) {
                    let _ = write!(out, ";{}", value);
                }
            }
            AlgOperator::Modify {
                entity,
                operation,
                update_targets,
                update_sources,
            } => {
                let _ = write!(out, "entity={},operation={}", entity, operation.tag());
                for (target, source) in update_targets.iter().zip(update_sources) {
                    let _ = write!(out, ",{}={}", target, source);
                }
            }
            AlgOperator::Identifier { entity } => {
                let _ = write!(out, "entity={}", entity);
            }
            AlgOperator::Transformer { from, to } => {
                let _ = write!(out, "from={},to={}", from, to);
            }
            AlgOperator::Match { kind, labels, alias } => {
                let _ = write!(out, "kind={},labels={:?},alias={}", kind.tag(), labels, alias);
            }
            AlgOperator::Unwind { field } => {
                let _ = write!(out, "field={}", field);
            }
        }
    }
}

impl PartialEq for AlgNode {
    fn eq(&self, other: &Self) -> bool {
        self.compare_string() == other.compare_string()
    }
}

impl Eq for AlgNode {}

impl fmt::Debug for AlgNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compare_string())
    }
}

fn infer_type(expr: &RexNode, input: &AlgRowType) -> PolyType {
    match expr {
        RexNode::Field(index) => input
            .fields
            .get(*index)
            .map(|f| f.ty)
            .unwrap_or(PolyType::Any),
        RexNode::Literal(PolyValue::Boolean(_)) => PolyType::Boolean,
        RexNode::Literal(PolyValue::Integer(_)) => PolyType::Integer,
        RexNode::Literal(PolyValue::Float(_)) => PolyType::Float,
        RexNode::Literal(PolyValue::Text(_)) => PolyType::Text,
        RexNode::Literal(PolyValue::Document(_)) => PolyType::Document,
        RexNode::Literal(PolyValue::Array(_)) => PolyType::Array,
        RexNode::Call { op, .. } => match op {
            super::rex::RexOp::Eq
            | super::rex::RexOp::NotEq
            | super::rex::RexOp::Lt
            | super::rex::RexOp::LtEq
            | super::rex::RexOp::Gt
            | super::rex::RexOp::GtEq
            | super::rex::RexOp::And
            | super::rex::RexOp::Or
            | super::rex::RexOp::Not
            | super::rex::RexOp::Visible => PolyType::Boolean,
            _ => PolyType::Any,
        },
        _ => PolyType::Any,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> EntityRef {
        EntityRef {
            id: 3,
            namespace: 1,
            name: "t".into(),
        }
    }

    fn scan() -> Arc<AlgNode> {
        AlgNode::new(
            AlgOperator::Scan {
                entity: entity(),
                row_type: AlgRowType::versioned_relational(["x"]),
            },
            AlgTraitSet::logical(DataModel::Relational),
            vec![],
        )
    }

    #[test]
    fn test_row_type_propagation() {
        let scan = scan();
        let filter = AlgNode::new(
            AlgOperator::Filter {
                condition: RexNode::eq(RexNode::Field(2), RexNode::literal(1)),
            },
            AlgTraitSet::logical(DataModel::Relational),
            vec![Arc::clone(&scan)],
        );
        assert_eq!(filter.row_type(), scan.row_type());

        let project = AlgNode::new(
            AlgOperator::Project {
                exprs: vec![RexNode::Field(2)],
                names: vec!["x".into()],
            },
            AlgTraitSet::logical(DataModel::Relational),
            vec![filter],
        );
        assert_eq!(project.row_type().field_count(), 1);
        assert_eq!(project.row_type().fields[0].ty, PolyType::Any);
    }

    #[test]
    fn test_compare_string_distinguishes_structure() {
        let a = scan();
        let b = scan();
        assert_eq!(a.compare_string(), b.compare_string());
        assert_eq!(&*a, &*b);

        let filter = AlgNode::new(
            AlgOperator::Filter {
                condition: RexNode::literal(true),
            },
            AlgTraitSet::logical(DataModel::Relational),
            vec![b],
        );
        assert_ne!(a.compare_string(), filter.compare_string());
    }

    #[test]
    fn test_identifier_row_type() {
        let values = AlgNode::new(
            AlgOperator::Values {
                row_type: AlgRowType::new(vec![AlgField::new("x", PolyType::Integer)]),
                tuples: vec![vec![PolyValue::Integer(1)]],
            },
            AlgTraitSet::logical(DataModel::Relational),
            vec![],
        );
        let identifier = AlgNode::new(
            AlgOperator::Identifier { entity: entity() },
            AlgTraitSet::logical(DataModel::Relational),
            vec![values],
        );
        let row_type = identifier.row_type();
        assert_eq!(row_type.field_index("_eid"), Some(0));
        assert_eq!(row_type.field_index("_vid"), Some(1));
        assert_eq!(row_type.field_index("x"), Some(2));
    }

    #[test]
    fn test_scanned_entity() {
        let scan = scan();
        let filter = AlgNode::new(
            AlgOperator::Filter {
                condition: RexNode::literal(true),
            },
            AlgTraitSet::logical(DataModel::Relational),
            vec![scan],
        );
        assert_eq!(filter.scanned_entity().unwrap().id, 3);
    }

    #[test]
    fn test_copy_with_traits_changes_convention() {
        let scan = scan();
        let physical = scan.copy_with_traits(
            AlgTraitSet::physical(DataModel::Relational, 7),
            vec![],
        );
        assert_eq!(physical.convention(), Convention::Physical(7));
        assert_ne!(scan.compare_string(), physical.compare_string());
    }
}
