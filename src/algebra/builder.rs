// Stack-based construction of algebra trees.
//
// Adapters and rewrite passes build plans through this builder rather than
// assembling nodes by hand; it keeps trait sets consistent and validates
// arity at build time.

use std::sync::Arc;

use crate::common::{DataModel, PolyValue};
use crate::error::{DbError, Result};

use super::node::{
    AggregateCall, AlgNode, AlgOperator, AlgTraitSet, Convention, EntityRef, FieldCollation,
    JoinKind, MatchKind, ModifyOperation,
};
use super::rex::RexNode;
use super::types::AlgRowType;

/// Builder over a stack of partial plans.
#[derive(Debug)]
pub struct AlgBuilder {
    stack: Vec<Arc<AlgNode>>,
    convention: Convention,
}

impl AlgBuilder {
    /// Builder producing logical nodes.
    pub fn logical() -> Self {
        Self {
            stack: Vec::new(),
            convention: Convention::Logical,
        }
    }

    /// Builder producing nodes in an adapter's physical convention.
    pub fn physical(adapter: crate::common::AdapterId) -> Self {
        Self {
            stack: Vec::new(),
            convention: Convention::Physical(adapter),
        }
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    fn traits(&self, model: DataModel) -> AlgTraitSet {
        AlgTraitSet {
            model,
            convention: self.convention,
            collation: Vec::new(),
        }
    }

    pub fn push(&mut self, node: Arc<AlgNode>) -> &mut Self {
        self.stack.push(node);
        self
    }

    pub fn pop(&mut self) -> Result<Arc<AlgNode>> {
        self.stack
            .pop()
            .ok_or_else(|| DbError::Algebra("builder stack underflow".into()))
    }

    pub fn peek(&self) -> Result<&Arc<AlgNode>> {
        self.stack
            .last()
            .ok_or_else(|| DbError::Algebra("builder stack empty".into()))
    }

    /// Finishes the build; exactly one tree must remain.
    pub fn build(&mut self) -> Result<Arc<AlgNode>> {
        let root = self.pop()?;
        if !self.stack.is_empty() {
            return Err(DbError::Algebra(format!(
                "builder finished with {} dangling subtree(s)",
                self.stack.len()
            )));
        }
        Ok(root)
    }

    // ------------------------------------------------------------------
    // Leaves
    // ------------------------------------------------------------------

    pub fn scan(&mut self, model: DataModel, entity: EntityRef, row_type: AlgRowType) -> &mut Self {
        let traits = self.traits(model);
        self.push(AlgNode::new(
            AlgOperator::Scan { entity, row_type },
            traits,
            vec![],
        ))
    }

    pub fn values(&mut self, row_type: AlgRowType, tuples: Vec<Vec<PolyValue>>) -> &mut Self {
        let traits = self.traits(DataModel::Relational);
        self.push(AlgNode::new(
            AlgOperator::Values { row_type, tuples },
            traits,
            vec![],
        ))
    }

    pub fn document_values(&mut self, documents: Vec<PolyValue>) -> &mut Self {
        let traits = self.traits(DataModel::Document);
        self.push(AlgNode::new(
            AlgOperator::DocumentValues { documents },
            traits,
            vec![],
        ))
    }

    pub fn lpg_values(&mut self, nodes: Vec<PolyValue>, edges: Vec<PolyValue>) -> &mut Self {
        let traits = self.traits(DataModel::Graph);
        self.push(AlgNode::new(
            AlgOperator::LpgValues { nodes, edges },
            traits,
            vec![],
        ))
    }

    // ------------------------------------------------------------------
    // Single-input operators
    // ------------------------------------------------------------------

    fn wrap(&mut self, op: AlgOperator) -> Result<&mut Self> {
        let input = self.pop()?;
        let traits = self.traits(input.model());
        self.push(AlgNode::new(op, traits, vec![input]));
        Ok(self)
    }

    pub fn filter(&mut self, condition: RexNode) -> Result<&mut Self> {
        self.wrap(AlgOperator::Filter { condition })
    }

    pub fn project(&mut self, exprs: Vec<RexNode>, names: Vec<String>) -> Result<&mut Self> {
        if exprs.len() != names.len() {
            return Err(DbError::Algebra(
                "projection exprs and names differ in length".into(),
            ));
        }
        self.wrap(AlgOperator::Project { exprs, names })
    }

    pub fn sort(
        &mut self,
        collation: Vec<FieldCollation>,
        offset: Option<usize>,
        fetch: Option<usize>,
    ) -> Result<&mut Self> {
        self.wrap(AlgOperator::Sort {
            collation,
            offset,
            fetch,
        })
    }

    pub fn aggregate(&mut self, group: Vec<usize>, calls: Vec<AggregateCall>) -> Result<&mut Self> {
        self.wrap(AlgOperator::Aggregate { group, calls })
    }

    pub fn identifier(&mut self, entity: EntityRef) -> Result<&mut Self> {
        self.wrap(AlgOperator::Identifier { entity })
    }

    pub fn unwind(&mut self, field: impl Into<String>) -> Result<&mut Self> {
        self.wrap(AlgOperator::Unwind {
            field: field.into(),
        })
    }

    pub fn graph_match(
        &mut self,
        kind: MatchKind,
        labels: Vec<String>,
        alias: impl Into<String>,
    ) -> Result<&mut Self> {
        self.wrap(AlgOperator::Match {
            kind,
            labels,
            alias: alias.into(),
        })
    }

    pub fn modify(
        &mut self,
        entity: EntityRef,
        operation: ModifyOperation,
        update_targets: Vec<String>,
        update_sources: Vec<RexNode>,
    ) -> Result<&mut Self> {
        self.wrap(AlgOperator::Modify {
            entity,
            operation,
            update_targets,
            update_sources,
        })
    }

    // ------------------------------------------------------------------
    // Multi-input operators
    // ------------------------------------------------------------------

    fn combine(&mut self, op: AlgOperator, arity: usize, model: Option<DataModel>) -> Result<&mut Self> {
        if self.stack.len() < arity {
            return Err(DbError::Algebra(format!(
                "{} requires {} inputs, stack has {}",
                op.tag(),
                arity,
                self.stack.len()
            )));
        }
        let at = self.stack.len() - arity;
        let inputs: Vec<Arc<AlgNode>> = self.stack.split_off(at);
        let model = model.unwrap_or_else(|| inputs[0].model());
        let traits = self.traits(model);
        self.push(AlgNode::new(op, traits, inputs));
        Ok(self)
    }

    /// Joins the two topmost subtrees (left below right).
    pub fn join(&mut self, kind: JoinKind, condition: RexNode) -> Result<&mut Self> {
        self.combine(AlgOperator::Join { kind, condition }, 2, None)
    }

    pub fn union(&mut self, all: bool) -> Result<&mut Self> {
        self.combine(AlgOperator::Union { all }, 2, None)
    }

    pub fn intersect(&mut self, all: bool) -> Result<&mut Self> {
        self.combine(AlgOperator::Intersect { all }, 2, None)
    }

    pub fn minus(&mut self, all: bool) -> Result<&mut Self> {
        self.combine(AlgOperator::Minus { all }, 2, None)
    }

    /// Model boundary over the topmost `arity` subtrees. A GRAPH transform
    /// composes four relational scans; DOC transforms take one input.
    pub fn transformer(&mut self, from: DataModel, to: DataModel, arity: usize) -> Result<&mut Self> {
        self.combine(AlgOperator::Transformer { from, to }, arity, Some(to))
    }
}
