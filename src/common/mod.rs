// # Common Types
//
// Shared identifiers and the cross-model value type used by every subsystem.
// The kernel federates relational, document, and graph stores behind a single
// algebra, so a row field must be able to hold anything any of the three
// models produces.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for transactions, drawn from the kernel sequencer.
pub type TransactionId = i64;

/// Version ticket: snapshot at begin, commit instant at commit.
pub type VersionId = i64;

/// Stable tuple identifier, assigned once on insert and preserved by updates.
pub type EntryId = i64;

/// Unique identifier for logical entities (tables, collections, graphs).
pub type EntityId = u64;

/// Unique identifier for namespaces.
pub type NamespaceId = u64;

/// Unique identifier for deployed adapter instances.
pub type AdapterId = u64;

/// Identifier of a scan allocation (entity placement on an adapter).
pub type AllocationId = u64;

// ============================================================================
// Reserved Fields
// ============================================================================

/// Field carrying the stable tuple identifier on every MVCC tuple.
pub const ENTRY_ID_FIELD: &str = "_eid";

/// Field carrying the signed version number on every MVCC tuple.
pub const VERSION_FIELD: &str = "_vid";

/// Returns true for field names the kernel manages itself. User statements
/// must never set these.
pub fn is_reserved_field(name: &str) -> bool {
    name == ENTRY_ID_FIELD || name == VERSION_FIELD
}

// ============================================================================
// Data Models and Entity Kinds
// ============================================================================

/// The three data models the kernel federates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataModel {
    Relational,
    Document,
    Graph,
}

impl fmt::Display for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataModel::Relational => write!(f, "RELATIONAL"),
            DataModel::Document => write!(f, "DOCUMENT"),
            DataModel::Graph => write!(f, "GRAPH"),
        }
    }
}

/// Kind of a logical entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    /// Plain modifiable entity backed by one or more stores.
    Entity,
    /// Virtual view over other entities.
    View,
    /// Materialized view with refreshable backing data.
    MaterializedView,
    /// Read-only data source surfaced by a source adapter.
    Source,
}

impl EntityType {
    /// Views and sources reject data modification.
    pub fn is_modifiable(&self) -> bool {
        matches!(self, EntityType::Entity | EntityType::MaterializedView)
    }
}

// ============================================================================
// Cross-Model Value Type
// ============================================================================

/// A single value flowing through the algebra.
///
/// Rows produced by relational scans hold scalars; document scans produce one
/// `Document` per row; graph scans produce documents describing nodes and
/// edges. `Array` and `Document` nest arbitrarily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolyValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Array(Vec<PolyValue>),
    Document(BTreeMap<String, PolyValue>),
}

impl PolyValue {
    /// Builds a document value from key/value pairs.
    pub fn document<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, PolyValue)>,
        K: Into<String>,
    {
        PolyValue::Document(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PolyValue::Null)
    }

    /// Reads a top-level or dotted-path field out of a document value.
    pub fn get_path(&self, path: &str) -> Option<&PolyValue> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                PolyValue::Document(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Returns the name of the first reserved field found anywhere inside
    /// this value, walking nested documents and arrays.
    pub fn find_reserved_field(&self) -> Option<&str> {
        match self {
            PolyValue::Document(map) => {
                for (key, value) in map {
                    if is_reserved_field(key) {
                        return Some(key);
                    }
                    if let Some(hit) = value.find_reserved_field() {
                        return Some(hit);
                    }
                }
                None
            }
            PolyValue::Array(items) => items.iter().find_map(PolyValue::find_reserved_field),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PolyValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PolyValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PolyValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Total order over values, used by sort and set operations. Values of
    /// different types order by type tag; NULL sorts first.
    pub fn compare(&self, other: &PolyValue) -> Ordering {
        use PolyValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Text(a), Text(b)) => a.cmp(b),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Document(a), Document(b)) => {
                let mut ai = a.iter();
                let mut bi = b.iter();
                loop {
                    match (ai.next(), bi.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some((ka, va)), Some((kb, vb))) => {
                            let ord = ka.cmp(kb).then_with(|| va.compare(vb));
                            if ord != Ordering::Equal {
                                return ord;
                            }
                        }
                    }
                }
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            PolyValue::Null => 0,
            PolyValue::Boolean(_) => 1,
            PolyValue::Integer(_) => 2,
            PolyValue::Float(_) => 2,
            PolyValue::Text(_) => 3,
            PolyValue::Array(_) => 4,
            PolyValue::Document(_) => 5,
        }
    }
}

impl fmt::Display for PolyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolyValue::Null => write!(f, "NULL"),
            PolyValue::Boolean(v) => write!(f, "{}", v),
            PolyValue::Integer(v) => write!(f, "{}", v),
            PolyValue::Float(v) => write!(f, "{}", v),
            PolyValue::Text(v) => write!(f, "'{}'", v),
            PolyValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            PolyValue::Document(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for PolyValue {
    fn from(v: i64) -> Self {
        PolyValue::Integer(v)
    }
}

impl From<bool> for PolyValue {
    fn from(v: bool) -> Self {
        PolyValue::Boolean(v)
    }
}

impl From<&str> for PolyValue {
    fn from(v: &str) -> Self {
        PolyValue::Text(v.to_string())
    }
}

impl From<String> for PolyValue {
    fn from(v: String) -> Self {
        PolyValue::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_fields() {
        assert!(is_reserved_field("_eid"));
        assert!(is_reserved_field("_vid"));
        assert!(!is_reserved_field("name"));
    }

    #[test]
    fn test_find_reserved_field_nested() {
        let doc = PolyValue::document([(
            "payload",
            PolyValue::Array(vec![PolyValue::document([("_vid", PolyValue::Integer(5))])]),
        )]);
        assert_eq!(doc.find_reserved_field(), Some("_vid"));

        let clean = PolyValue::document([("a", PolyValue::Integer(1))]);
        assert_eq!(clean.find_reserved_field(), None);
    }

    #[test]
    fn test_get_path() {
        let doc = PolyValue::document([(
            "address",
            PolyValue::document([("city", PolyValue::from("basel"))]),
        )]);
        assert_eq!(
            doc.get_path("address.city"),
            Some(&PolyValue::from("basel"))
        );
        assert_eq!(doc.get_path("address.zip"), None);
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(
            PolyValue::Integer(1).compare(&PolyValue::Integer(2)),
            Ordering::Less
        );
        assert_eq!(
            PolyValue::Null.compare(&PolyValue::Integer(0)),
            Ordering::Less
        );
        assert_eq!(
            PolyValue::Integer(2).compare(&PolyValue::Float(1.5)),
            Ordering::Greater
        );
    }
}
