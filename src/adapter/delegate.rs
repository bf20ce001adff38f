// Relational scan delegate.
//
// A relational-only adapter serves document and graph requests by composing
// its relational primitives. Collections live in a backing table
// `(id, d)`; graphs live in four backing tables (nodes, node properties,
// edges, edge properties). The delegate builds the physical subtrees for
// both layouts; adapters that follow its table conventions get document and
// graph scans for free.

use std::sync::Arc;

use crate::algebra::node::{AlgNode, EntityRef};
use crate::algebra::types::{AlgField, AlgRowType, PolyType};
use crate::algebra::AlgBuilder;
use crate::common::{DataModel, EntityId};
use crate::error::Result;

/// Offset separating the synthetic part entities of a delegated graph from
/// catalog entity ids. Catalog ids are small counters; the stride keeps the
/// two ranges disjoint.
pub const GRAPH_PART_STRIDE: u64 = 1 << 40;

/// The four relational parts of a delegated graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphPart {
    Nodes = 1,
    NodeProperties = 2,
    Edges = 3,
    EdgeProperties = 4,
}

impl GraphPart {
    pub const ALL: [GraphPart; 4] = [
        GraphPart::Nodes,
        GraphPart::NodeProperties,
        GraphPart::Edges,
        GraphPart::EdgeProperties,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            GraphPart::Nodes => "$nodes",
            GraphPart::NodeProperties => "$node_props",
            GraphPart::Edges => "$edges",
            GraphPart::EdgeProperties => "$edge_props",
        }
    }

    /// Row layout of the part's backing table.
    pub fn row_type(&self) -> AlgRowType {
        let fields = match self {
            GraphPart::Nodes => vec![
                AlgField::new("id", PolyType::Integer),
                AlgField::new("label", PolyType::Text),
            ],
            GraphPart::NodeProperties => vec![
                AlgField::new("node_id", PolyType::Integer),
                AlgField::new("key", PolyType::Text),
                AlgField::new("value", PolyType::Any),
            ],
            GraphPart::Edges => vec![
                AlgField::new("id", PolyType::Integer),
                AlgField::new("source", PolyType::Integer),
                AlgField::new("target", PolyType::Integer),
                AlgField::new("label", PolyType::Text),
            ],
            GraphPart::EdgeProperties => vec![
                AlgField::new("edge_id", PolyType::Integer),
                AlgField::new("key", PolyType::Text),
                AlgField::new("value", PolyType::Any),
            ],
        };
        AlgRowType::new(fields)
    }
}

/// Synthetic entity id of one part table of a delegated graph.
pub fn graph_part_id(entity: EntityId, part: GraphPart) -> EntityId {
    entity + GRAPH_PART_STRIDE * part as u64
}

/// Backing-table layout of a delegated document collection.
pub fn document_backing_row_type() -> AlgRowType {
    AlgRowType::new(vec![
        AlgField::new("id", PolyType::Integer),
        AlgField::new("d", PolyType::Document),
    ])
}

/// Builds document and graph subtrees from relational primitives.
pub struct RelationalScanDelegate;

impl RelationalScanDelegate {
    /// Collection scan: backing-table scan under a DOC transform.
    pub fn document_scan(builder: &mut AlgBuilder, entity: &EntityRef) -> Result<Arc<AlgNode>> {
        builder
            .scan(
                DataModel::Relational,
                entity.clone(),
                document_backing_row_type(),
            )
            .transformer(DataModel::Relational, DataModel::Document, 1)?;
        Ok(builder.peek()?.clone())
    }

    /// Graph scan: four relational scans composed with a GRAPH transform.
    pub fn graph_scan(builder: &mut AlgBuilder, entity: &EntityRef) -> Result<Arc<AlgNode>> {
        for part in GraphPart::ALL {
            builder.scan(
                DataModel::Relational,
                EntityRef {
                    id: graph_part_id(entity.id, part),
                    namespace: entity.namespace,
                    name: format!("{}{}", entity.name, part.suffix()),
                },
                part.row_type(),
            );
        }
        builder.transformer(DataModel::Relational, DataModel::Graph, 4)?;
        Ok(builder.peek()?.clone())
    }
}
