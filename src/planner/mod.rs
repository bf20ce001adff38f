// Planner driver: logical algebra to per-adapter physical algebra.
//
// Rules are total functions: given a logical node and its already-converted
// inputs, a rule returns a physical node or `None` for "not applicable".
// Capability predicates gate rules by what the target adapter can do. The
// driver memoizes conversions by compare string, so shared subtrees convert
// once. Cost-based enumeration sits behind this interface; the driver picks
// the first applicable rule.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{AdapterCapabilities, RelationalScanDelegate};
use crate::algebra::node::{AlgNode, AlgOperator, AlgTraitSet};
use crate::algebra::AlgBuilder;
use crate::common::{AdapterId, DataModel};
use crate::error::{DbError, Result};

/// The adapter a subtree is being converted for.
#[derive(Debug, Clone, Copy)]
pub struct ConversionTarget {
    pub adapter: AdapterId,
    pub capabilities: AdapterCapabilities,
}

/// One conversion rule.
pub trait ConvertRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Converts `node` given converted `inputs`, or declines with `None`.
    fn convert(
        &self,
        node: &AlgNode,
        inputs: &[Arc<AlgNode>],
        target: &ConversionTarget,
    ) -> Option<Arc<AlgNode>>;
}

// ============================================================================
// Capability predicates
// ============================================================================

pub fn supports_model(caps: &AdapterCapabilities, model: DataModel) -> bool {
    caps.supports_model(model)
}

pub fn supports_join(caps: &AdapterCapabilities) -> bool {
    caps.joins
}

pub fn supports_modify(caps: &AdapterCapabilities) -> bool {
    caps.modify
}

pub fn supports_nested_arrays(caps: &AdapterCapabilities) -> bool {
    caps.nested_arrays
}

/// Document/graph requests can be served by a relational-only adapter
/// through the scan delegate.
pub fn delegatable(caps: &AdapterCapabilities, model: DataModel) -> bool {
    !caps.supports_model(model) && caps.relational && model != DataModel::Relational
}

// ============================================================================
// Default rules
// ============================================================================

fn physicalize(node: &AlgNode, inputs: &[Arc<AlgNode>], target: &ConversionTarget) -> Arc<AlgNode> {
    node.copy_with_traits(
        AlgTraitSet::physical(node.model(), target.adapter),
        inputs.to_vec(),
    )
}

/// Scans of a natively supported model convert one-to-one.
struct ScanRule;

impl ConvertRule for ScanRule {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn convert(
        &self,
        node: &AlgNode,
        inputs: &[Arc<AlgNode>],
        target: &ConversionTarget,
    ) -> Option<Arc<AlgNode>> {
        matches!(node.op(), AlgOperator::Scan { .. })
            .then(|| supports_model(&target.capabilities, node.model()))
            .filter(|&ok| ok)
            .map(|_| physicalize(node, inputs, target))
    }
}

/// Document and graph scans on relational-only adapters go through the
/// relational scan delegate.
struct DelegateScanRule;

impl ConvertRule for DelegateScanRule {
    fn name(&self) -> &'static str {
        "delegate-scan"
    }

    fn convert(
        &self,
        node: &AlgNode,
        _inputs: &[Arc<AlgNode>],
        target: &ConversionTarget,
    ) -> Option<Arc<AlgNode>> {
        let entity = match node.op() {
            AlgOperator::Scan { entity, .. } => entity,
            _ => return None,
        };
        if !delegatable(&target.capabilities, node.model()) {
            return None;
        }
        let mut builder = AlgBuilder::physical(target.adapter);
        let composed = match node.model() {
            DataModel::Document => RelationalScanDelegate::document_scan(&mut builder, entity),
            DataModel::Graph => RelationalScanDelegate::graph_scan(&mut builder, entity),
            DataModel::Relational => return None,
        };
        composed.ok()
    }
}

/// Structure-preserving conversions for operators any executing adapter
/// handles, gated by capability where the operator needs one.
struct OperatorRule;

impl ConvertRule for OperatorRule {
    fn name(&self) -> &'static str {
        "operator"
    }

    fn convert(
        &self,
        node: &AlgNode,
        inputs: &[Arc<AlgNode>],
        target: &ConversionTarget,
    ) -> Option<Arc<AlgNode>> {
        let caps = &target.capabilities;
        let applicable = match node.op() {
            AlgOperator::Scan { .. } => false,
            AlgOperator::Join { .. } => supports_join(caps),
            AlgOperator::Modify { .. } | AlgOperator::Identifier { .. } => supports_modify(caps),
            AlgOperator::Unwind { .. } => {
                supports_nested_arrays(caps) || supports_model(caps, DataModel::Document)
            }
            AlgOperator::Match { .. } => {
                supports_model(caps, DataModel::Graph) || delegatable(caps, DataModel::Graph)
            }
            AlgOperator::Filter { .. }
            | AlgOperator::Project { .. }
            | AlgOperator::Union { .. }
            | AlgOperator::Intersect { .. }
            | AlgOperator::Minus { .. }
            | AlgOperator::Sort { .. }
            | AlgOperator::Aggregate { .. }
            | AlgOperator::Values { .. }
            | AlgOperator::DocumentValues { .. }
            | AlgOperator::LpgValues { .. }
            | AlgOperator::Transformer { .. } => true,
        };
        applicable.then(|| physicalize(node, inputs, target))
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Memoizing rule-application driver.
pub struct PlannerDriver {
    rules: Vec<Arc<dyn ConvertRule>>,
    memo: Mutex<HashMap<(String, AdapterId), Arc<AlgNode>>>,
}

impl PlannerDriver {
    /// Driver with the default rule set.
    pub fn new() -> Self {
        Self {
            rules: vec![
                Arc::new(ScanRule),
                Arc::new(DelegateScanRule),
                Arc::new(OperatorRule),
            ],
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Prepends a rule; later registrations take precedence over the
    /// defaults.
    pub fn add_rule(&mut self, rule: Arc<dyn ConvertRule>) {
        self.rules.insert(0, rule);
    }

    /// Converts a logical tree into the target adapter's physical
    /// convention.
    pub fn convert_for_adapter(
        &self,
        node: &Arc<AlgNode>,
        target: &ConversionTarget,
    ) -> Result<Arc<AlgNode>> {
        let key = (node.compare_string().to_string(), target.adapter);
        if let Some(found) = self.memo.lock().get(&key) {
            return Ok(Arc::clone(found));
        }

        let inputs = node
            .inputs()
            .iter()
            .map(|input| self.convert_for_adapter(input, target))
            .collect::<Result<Vec<_>>>()?;

        for rule in &self.rules {
            if let Some(physical) = rule.convert(node, &inputs, target) {
                tracing::trace!(rule = rule.name(), tag = node.op().tag(), "converted");
                self.memo.lock().insert(key, Arc::clone(&physical));
                return Ok(physical);
            }
        }
        Err(DbError::Planner(format!(
            "no rule converts {} ({}) for adapter {}",
            node.op().tag(),
            node.model(),
            target.adapter
        )))
    }
}

impl Default for PlannerDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::node::{Convention, EntityRef};
    use crate::algebra::rex::RexNode;
    use crate::algebra::types::AlgRowType;

    fn entity() -> EntityRef {
        EntityRef {
            id: 3,
            namespace: 1,
            name: "t".into(),
        }
    }

    fn logical_plan() -> Arc<AlgNode> {
        AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x"]),
            )
            .filter(RexNode::eq(RexNode::Field(2), RexNode::literal(1)))
            .unwrap()
            .build()
            .unwrap()
    }

    fn target(capabilities: AdapterCapabilities) -> ConversionTarget {
        ConversionTarget {
            adapter: 7,
            capabilities,
        }
    }

    #[test]
    fn test_whole_tree_converts() {
        let driver = PlannerDriver::new();
        let physical = driver
            .convert_for_adapter(&logical_plan(), &target(AdapterCapabilities::polystore()))
            .unwrap();
        assert_eq!(physical.convention(), Convention::Physical(7));
        assert_eq!(physical.input(0).convention(), Convention::Physical(7));
    }

    #[test]
    fn test_memo_reuses_conversions() {
        let driver = PlannerDriver::new();
        let plan = logical_plan();
        let t = target(AdapterCapabilities::polystore());
        let first = driver.convert_for_adapter(&plan, &t).unwrap();
        let second = driver.convert_for_adapter(&plan, &t).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_document_scan_delegated_for_relational_store() {
        let driver = PlannerDriver::new();
        let plan = AlgBuilder::logical()
            .scan(DataModel::Document, entity(), AlgRowType::versioned_document())
            .build()
            .unwrap();
        let physical = driver
            .convert_for_adapter(&plan, &target(AdapterCapabilities::relational_only()))
            .unwrap();
        assert!(matches!(
            physical.op(),
            AlgOperator::Transformer {
                to: DataModel::Document,
                ..
            }
        ));
    }

    #[test]
    fn test_unconvertible_operator_errors() {
        let mut caps = AdapterCapabilities::relational_only();
        caps.joins = false;
        let driver = PlannerDriver::new();
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x"]),
            )
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x"]),
            )
            .join(crate::algebra::JoinKind::Inner, RexNode::literal(true))
            .unwrap()
            .build()
            .unwrap();
        let result = driver.convert_for_adapter(&plan, &target(caps));
        assert!(matches!(result, Err(DbError::Planner(_))));
    }
}
