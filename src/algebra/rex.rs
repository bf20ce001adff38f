// Row expressions.
//
// Rex expressions live inside filter conditions, projections, and join
// conditions. The textual rendering is stable and is reused verbatim by the
// PolyAlg serialization and by operator compare strings, so it must stay
// deterministic.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::PolyValue;

/// Operator of a Rex call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RexOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Times,
    Divide,
    /// Document update: `[doc, key, value]` evaluates to the document with
    /// `key` set to `value`.
    SetField,
    /// Snapshot visibility over `[_vid field, snapshot, reader id]`.
    ///
    /// Semantically a row-set predicate: of all versions of a tuple, exactly
    /// the newest one visible to the reader passes, and none passes if that
    /// version is a tombstone.
    Visible,
}

impl RexOp {
    pub fn tag(&self) -> &'static str {
        match self {
            RexOp::Eq => "=",
            RexOp::NotEq => "<>",
            RexOp::Lt => "<",
            RexOp::LtEq => "<=",
            RexOp::Gt => ">",
            RexOp::GtEq => ">=",
            RexOp::And => "AND",
            RexOp::Or => "OR",
            RexOp::Not => "NOT",
            RexOp::Plus => "+",
            RexOp::Minus => "-",
            RexOp::Times => "*",
            RexOp::Divide => "/",
            RexOp::SetField => "SET_FIELD",
            RexOp::Visible => "VISIBLE",
        }
    }

    pub fn from_tag(tag: &str) -> Option<RexOp> {
        Some(match tag {
            "=" => RexOp::Eq,
            "<>" => RexOp::NotEq,
            "<" => RexOp::Lt,
            "<=" => RexOp::LtEq,
            ">" => RexOp::Gt,
            ">=" => RexOp::GtEq,
            "AND" => RexOp::And,
            "OR" => RexOp::Or,
            "NOT" => RexOp::Not,
            "+" => RexOp::Plus,
            "-" => RexOp::Minus,
            "*" => RexOp::Times,
            "/" => RexOp::Divide,
            "SET_FIELD" => RexOp::SetField,
            "VISIBLE" => RexOp::Visible,
            _ => return None,
        })
    }
}

/// A row expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RexNode {
    /// Constant value.
    Literal(PolyValue),
    /// Input field by position.
    Field(usize),
    /// Field by name or dotted document path; resolved against the input
    /// row type (document and graph operators).
    NamedField(String),
    /// Operator application.
    Call { op: RexOp, operands: Vec<RexNode> },
}

impl RexNode {
    pub fn call(op: RexOp, operands: Vec<RexNode>) -> Self {
        RexNode::Call { op, operands }
    }

    pub fn eq(left: RexNode, right: RexNode) -> Self {
        RexNode::call(RexOp::Eq, vec![left, right])
    }

    pub fn and(operands: Vec<RexNode>) -> Self {
        RexNode::call(RexOp::And, operands)
    }

    pub fn literal(value: impl Into<PolyValue>) -> Self {
        RexNode::Literal(value.into())
    }

    /// True for the always-true literal, the conventional cross-join
    /// condition.
    pub fn is_always_true(&self) -> bool {
        matches!(self, RexNode::Literal(PolyValue::Boolean(true)))
    }

    /// Does any sub-expression reference the given named field?
    pub fn references_named(&self, name: &str) -> bool {
        match self {
            RexNode::NamedField(n) => n == name || n.starts_with(&format!("{}.", name)),
            RexNode::Call { operands, .. } => {
                operands.iter().any(|operand| operand.references_named(name))
            }
            _ => false,
        }
    }
}

impl fmt::Display for RexNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RexNode::Literal(value) => write!(f, "{}", value),
            RexNode::Field(index) => write!(f, "#{}", index),
            RexNode::NamedField(name) => write!(f, "${}", name),
            RexNode::Call { op, operands } => {
                write!(f, "{}(", op.tag())?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", operand)?;
                }
                write!(f, ")")
            }
        }
    }
}
