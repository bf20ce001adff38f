// Cross-model algebra: the IR between surface languages and execution.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | Row types and materialized row sets |
// | [`rex`] | Row expressions |
// | [`node`] | Operator tree, trait sets, compare strings |
// | [`builder`] | Stack-based plan construction |
// | [`mvcc_pass`] | Snapshot limits and identifier injection |
// | [`polyalg`] | Textual and JSON serialization |

pub mod builder;
pub mod mvcc_pass;
pub mod node;
pub mod polyalg;
pub mod rex;
pub mod types;

pub use builder::AlgBuilder;
pub use mvcc_pass::{rewrite_for_transaction, MvccShuttle};
pub use node::{
    AggFunction, AggregateCall, AlgNode, AlgOperator, AlgTraitSet, Convention, EntityRef,
    FieldCollation, JoinKind, MatchKind, ModifyOperation,
};
pub use rex::{RexNode, RexOp};
pub use types::{AlgField, AlgRowType, PolyType, RowSet};
