// PolyAlg: the external serialization of algebra trees.
//
// Textual form: `TAG[key=value, ...](input, ...)` with a model prefix on the
// tag (`REL_`, `DOC_`, `LPG_`). Parameters come from a closed set of typed
// arguments: INTEGER, BOOLEAN, STRING, LITERAL, FIELD, REX, ENTITY, and LIST
// of any of them. Lists of lists use bracket grouping; list elements may
// carry an `AS alias`. The JSON form mirrors the same parameter model with
// explicit type tags.
//
// Round-trip (parse . print) is lossless modulo whitespace and trait
// normalization; the tests below pin that per operator.

use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::common::{DataModel, PolyValue};
use crate::error::{DbError, Result};

use super::node::{
    AggFunction, AggregateCall, AlgNode, AlgOperator, AlgTraitSet, Convention, EntityRef,
    FieldCollation, JoinKind, MatchKind, ModifyOperation,
};
use super::rex::{RexNode, RexOp};
use super::types::{AlgField, AlgRowType, PolyType};

// ============================================================================
// Typed parameters
// ============================================================================

/// One typed argument of a serialized operator.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Integer(i64),
    Boolean(bool),
    Str(String),
    Literal(PolyValue),
    Field(String),
    Rex(RexNode),
    Entity(EntityRef),
    List(Vec<ParamElement>),
}

/// List element with an optional alias (`value AS alias`).
#[derive(Debug, Clone, PartialEq)]
pub struct ParamElement {
    pub value: ParamValue,
    pub alias: Option<String>,
}

impl ParamElement {
    fn plain(value: ParamValue) -> Self {
        Self { value, alias: None }
    }

    fn aliased(value: ParamValue, alias: impl Into<String>) -> Self {
        Self {
            value,
            alias: Some(alias.into()),
        }
    }
}

fn model_prefix(model: DataModel) -> &'static str {
    match model {
        DataModel::Relational => "REL",
        DataModel::Document => "DOC",
        DataModel::Graph => "LPG",
    }
}

fn model_from_prefix(prefix: &str) -> Option<DataModel> {
    match prefix {
        "REL" => Some(DataModel::Relational),
        "DOC" => Some(DataModel::Document),
        "LPG" => Some(DataModel::Graph),
        _ => None,
    }
}

/// Serialized tag: model prefix plus the operator name. The model-specific
/// values variants share the `VALUES` name; the prefix disambiguates.
fn tag_of(node: &AlgNode) -> String {
    let base = match node.op() {
        AlgOperator::DocumentValues { .. } | AlgOperator::LpgValues { .. } => "VALUES",
        op => op.tag(),
    };
    format!("{}_{}", model_prefix(node.model()), base)
}

fn fields_param(row_type: &AlgRowType) -> ParamValue {
    ParamValue::List(
        row_type
            .fields
            .iter()
            .map(|f| ParamElement::plain(ParamValue::Str(format!("{}:{}", f.name, f.ty))))
            .collect(),
    )
}

fn parse_fields_param(param: &ParamValue) -> Result<AlgRowType> {
    let elements = expect_list(param, "fields")?;
    let mut fields = Vec::with_capacity(elements.len());
    for element in elements {
        let text = expect_str(&element.value, "fields element")?;
        let (name, ty) = text
            .split_once(':')
            .ok_or_else(|| DbError::Serialization(format!("malformed field '{}'", text)))?;
        fields.push(AlgField::new(name, parse_poly_type(ty)?));
    }
    Ok(AlgRowType::new(fields))
}

fn parse_poly_type(text: &str) -> Result<PolyType> {
    Ok(match text {
        "BOOLEAN" => PolyType::Boolean,
        "INTEGER" => PolyType::Integer,
        "FLOAT" => PolyType::Float,
        "TEXT" => PolyType::Text,
        "DOCUMENT" => PolyType::Document,
        "ARRAY" => PolyType::Array,
        "ANY" => PolyType::Any,
        _ => return Err(DbError::Serialization(format!("unknown type '{}'", text))),
    })
}

/// The parameters of an operator, in serialization order.
pub fn params_of(node: &AlgNode) -> Vec<(&'static str, ParamValue)> {
    let mut params: Vec<(&'static str, ParamValue)> = match node.op() {
        AlgOperator::Scan { entity, row_type } => vec![
            ("entity", ParamValue::Entity(entity.clone())),
            ("fields", fields_param(row_type)),
        ],
        AlgOperator::Project { exprs, names } => vec![(
            "exprs",
            ParamValue::List(
                exprs
                    .iter()
                    .zip(names)
                    .map(|(expr, name)| {
                        ParamElement::aliased(ParamValue::Rex(expr.clone()), name.clone())
                    })
                    .collect(),
            ),
        )],
        AlgOperator::Filter { condition } => {
            vec![("condition", ParamValue::Rex(condition.clone()))]
        }
        AlgOperator::Join { kind, condition } => vec![
            ("kind", ParamValue::Str(kind.tag().to_string())),
            ("condition", ParamValue::Rex(condition.clone())),
        ],
        AlgOperator::Union { all }
        | AlgOperator::Intersect { all }
        | AlgOperator::Minus { all } => vec![("all", ParamValue::Boolean(*all))],
        AlgOperator::Sort {
            collation,
            offset,
            fetch,
        } => {
            let mut params = vec![(
                "collation",
                ParamValue::List(
                    collation
                        .iter()
                        .map(|c| ParamElement::plain(ParamValue::Str(c.to_string())))
                        .collect(),
                ),
            )];
            if let Some(offset) = offset {
                params.push(("offset", ParamValue::Integer(*offset as i64)));
            }
            if let Some(fetch) = fetch {
                params.push(("fetch", ParamValue::Integer(*fetch as i64)));
            }
            params
        }
        AlgOperator::Aggregate { group, calls } => vec![
            (
                "group",
                ParamValue::List(
                    group
                        .iter()
                        .map(|&i| ParamElement::plain(ParamValue::Field(format!("#{}", i))))
                        .collect(),
                ),
            ),
            (
                "calls",
                ParamValue::List(
                    calls
                        .iter()
                        .map(|c| ParamElement::plain(ParamValue::Str(c.to_string())))
                        .collect(),
                ),
            ),
        ],
        AlgOperator::Values { row_type, tuples } => vec![
            ("fields", fields_param(row_type)),
            (
                "tuples",
                ParamValue::List(
                    tuples
                        .iter()
                        .map(|row| {
                            ParamElement::plain(ParamValue::List(
                                row.iter()
                                    .map(|v| ParamElement::plain(ParamValue::Literal(v.clone())))
                                    .collect(),
                            ))
                        })
                        .collect(),
                ),
            ),
        ],
        AlgOperator::DocumentValues { documents } => vec![(
            "documents",
            ParamValue::List(
                documents
                    .iter()
                    .map(|d| ParamElement::plain(ParamValue::Literal(d.clone())))
                    .collect(),
            ),
        )],
        AlgOperator::LpgValues { nodes, edges } => vec![
            (
                "nodes",
                ParamValue::List(
                    nodes
                        .iter()
                        .map(|v| ParamElement::plain(ParamValue::Literal(v.clone())))
                        .collect(),
                ),
            ),
            (
                "edges",
                ParamValue::List(
                    edges
                        .iter()
                        .map(|v| ParamElement::plain(ParamValue::Literal(v.clone())))
                        .collect(),
                ),
            ),
        ],
        AlgOperator::Modify {
            entity,
            operation,
            update_targets,
            update_sources,
        } => {
            let mut params = vec![
                ("entity", ParamValue::Entity(entity.clone())),
                ("operation", ParamValue::Str(operation.tag().to_string())),
            ];
            if !update_targets.is_empty() {
                params.push((
                    "targets",
                    ParamValue::List(
                        update_targets
                            .iter()
                            .map(|t| ParamElement::plain(ParamValue::Str(t.clone())))
                            .collect(),
                    ),
                ));
                params.push((
                    "sources",
                    ParamValue::List(
                        update_sources
                            .iter()
                            .map(|s| ParamElement::plain(ParamValue::Rex(s.clone())))
                            .collect(),
                    ),
                ));
            }
            params
        }
        AlgOperator::Identifier { entity } => {
            vec![("entity", ParamValue::Entity(entity.clone()))]
        }
        AlgOperator::Transformer { from, to } => vec![
            ("from", ParamValue::Str(from.to_string())),
            ("to", ParamValue::Str(to.to_string())),
        ],
        AlgOperator::Match { kind, labels, alias } => vec![
            ("kind", ParamValue::Str(kind.tag().to_string())),
            (
                "labels",
                ParamValue::List(
                    labels
                        .iter()
                        .map(|l| ParamElement::plain(ParamValue::Str(l.clone())))
                        .collect(),
                ),
            ),
            ("alias", ParamValue::Str(alias.clone())),
        ],
        AlgOperator::Unwind { field } => vec![("field", ParamValue::Str(field.clone()))],
    };

    if let Convention::Physical(adapter) = node.convention() {
        params.push(("adapter", ParamValue::Integer(adapter as i64)));
    }
    params
}

// ============================================================================
// Printing
// ============================================================================

/// Renders the textual PolyAlg form.
pub fn print(node: &AlgNode) -> String {
    let mut out = String::new();
    print_into(node, &mut out);
    out
}

fn print_into(node: &AlgNode, out: &mut String) {
    let _ = write!(out, "{}[", tag_of(node));
    for (i, (name, value)) in params_of(node).iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}=", name);
        print_param(value, out);
    }
    out.push(']');
    if !node.inputs().is_empty() {
        out.push('(');
        for (i, input) in node.inputs().iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            print_into(input, out);
        }
        out.push(')');
    }
}

fn print_param(value: &ParamValue, out: &mut String) {
    match value {
        ParamValue::Integer(v) => {
            let _ = write!(out, "{}", v);
        }
        ParamValue::Boolean(v) => {
            let _ = write!(out, "{}", v);
        }
        ParamValue::Str(v) => {
            let _ = write!(out, "'{}'", v);
        }
        ParamValue::Literal(v) => {
            let _ = write!(out, "{}", v);
        }
        ParamValue::Field(v) => {
            let _ = write!(out, "{}", v);
        }
        ParamValue::Rex(v) => {
            let _ = write!(out, "{}", v);
        }
        ParamValue::Entity(v) => {
            let _ = write!(out, "{}", v);
        }
        ParamValue::List(elements) => {
            out.push('[');
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_param(&element.value, out);
                if let Some(alias) = &element.alias {
                    let _ = write!(out, " AS {}", alias);
                }
            }
            out.push(']');
        }
    }
}

// ============================================================================
// JSON form
// ============================================================================

/// Renders the JSON PolyAlg form.
pub fn to_json(node: &AlgNode) -> serde_json::Value {
    let params: serde_json::Map<String, serde_json::Value> = params_of(node)
        .into_iter()
        .map(|(name, value)| (name.to_string(), param_to_json(&value)))
        .collect();
    json!({
        "tag": tag_of(node),
        "params": params,
        "inputs": node.inputs().iter().map(|i| to_json(i)).collect::<Vec<_>>(),
    })
}

fn param_to_json(value: &ParamValue) -> serde_json::Value {
    match value {
        ParamValue::Integer(v) => json!({"type": "INTEGER", "value": v}),
        ParamValue::Boolean(v) => json!({"type": "BOOLEAN", "value": v}),
        ParamValue::Str(v) => json!({"type": "STRING", "value": v}),
        ParamValue::Literal(v) => {
            json!({"type": "LITERAL", "value": serde_json::to_value(v).unwrap_or_default()})
        }
        ParamValue::Field(v) => json!({"type": "FIELD", "value": v}),
        ParamValue::Rex(v) => json!({"type": "REX", "value": v.to_string()}),
        ParamValue::Entity(v) => json!({
            "type": "ENTITY",
            "value": {"id": v.id, "namespace": v.namespace, "name": v.name},
        }),
        ParamValue::List(elements) => json!({
            "type": "LIST",
            "value": elements
                .iter()
                .map(|e| {
                    let mut obj = serde_json::Map::new();
                    obj.insert("element".into(), param_to_json(&e.value));
                    if let Some(alias) = &e.alias {
                        obj.insert("alias".into(), json!(alias));
                    }
                    serde_json::Value::Object(obj)
                })
                .collect::<Vec<_>>(),
        }),
    }
}

/// Parses the JSON PolyAlg form.
pub fn from_json(value: &serde_json::Value) -> Result<Arc<AlgNode>> {
    let tag = value
        .get("tag")
        .and_then(|t| t.as_str())
        .ok_or_else(|| DbError::Serialization("node without tag".into()))?;
    let mut params = BTreeMap::new();
    if let Some(map) = value.get("params").and_then(|p| p.as_object()) {
        for (name, param) in map {
            params.insert(name.clone(), param_from_json(param)?);
        }
    }
    let mut inputs = Vec::new();
    if let Some(list) = value.get("inputs").and_then(|i| i.as_array()) {
        for input in list {
            inputs.push(from_json(input)?);
        }
    }
    assemble(tag, params, inputs)
}

fn param_from_json(value: &serde_json::Value) -> Result<ParamValue> {
    let ty = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| DbError::Serialization("param without type".into()))?;
    let payload = value
        .get("value")
        .ok_or_else(|| DbError::Serialization("param without value".into()))?;
    Ok(match ty {
        "INTEGER" => ParamValue::Integer(
            payload
                .as_i64()
                .ok_or_else(|| DbError::Serialization("INTEGER param not an integer".into()))?,
        ),
        "BOOLEAN" => ParamValue::Boolean(
            payload
                .as_bool()
                .ok_or_else(|| DbError::Serialization("BOOLEAN param not a boolean".into()))?,
        ),
        "STRING" => ParamValue::Str(
            payload
                .as_str()
                .ok_or_else(|| DbError::Serialization("STRING param not a string".into()))?
                .to_string(),
        ),
        "LITERAL" => ParamValue::Literal(serde_json::from_value(payload.clone())?),
        "FIELD" => ParamValue::Field(
            payload
                .as_str()
                .ok_or_else(|| DbError::Serialization("FIELD param not a string".into()))?
                .to_string(),
        ),
        "REX" => {
            let text = payload
                .as_str()
                .ok_or_else(|| DbError::Serialization("REX param not a string".into()))?;
            ParamValue::Rex(parse_rex_text(text)?)
        }
        "ENTITY" => {
            let id = payload.get("id").and_then(|v| v.as_u64());
            let namespace = payload.get("namespace").and_then(|v| v.as_u64());
            let name = payload.get("name").and_then(|v| v.as_str());
            match (id, namespace, name) {
                (Some(id), Some(namespace), Some(name)) => ParamValue::Entity(EntityRef {
                    id,
                    namespace,
                    name: name.to_string(),
                }),
                _ => return Err(DbError::Serialization("malformed ENTITY param".into())),
            }
        }
        "LIST" => {
            let items = payload
                .as_array()
                .ok_or_else(|| DbError::Serialization("LIST param not an array".into()))?;
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                let element = item
                    .get("element")
                    .ok_or_else(|| DbError::Serialization("LIST item without element".into()))?;
                elements.push(ParamElement {
                    value: param_from_json(element)?,
                    alias: item
                        .get("alias")
                        .and_then(|a| a.as_str())
                        .map(str::to_string),
                });
            }
            ParamValue::List(elements)
        }
        _ => {
            return Err(DbError::Serialization(format!(
                "unknown param type '{}'",
                ty
            )))
        }
    })
}

// ============================================================================
// Parsing (textual form)
// ============================================================================

/// Parses the textual PolyAlg form.
pub fn parse(text: &str) -> Result<Arc<AlgNode>> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, at: 0 };
    let node = parser.node()?;
    parser.expect_end()?;
    Ok(node)
}

fn parse_rex_text(text: &str) -> Result<RexNode> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, at: 0 };
    let rex = parser.rex()?;
    parser.expect_end()?;
    Ok(rex)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Text(String),
    Punct(&'static str),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || (chars[i] == '.'
                        && chars.get(i + 1).map(|n| n.is_ascii_digit()).unwrap_or(false)))
            {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }
        if c == '\'' {
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && chars[j] != '\'' {
                j += 1;
            }
            if j >= chars.len() {
                return Err(DbError::Serialization("unterminated string".into()));
            }
            tokens.push(Token::Text(chars[start..j].iter().collect()));
            i = j + 1;
            continue;
        }
        let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let punct = match two.as_str() {
            "<=" => Some("<="),
            ">=" => Some(">="),
            "<>" => Some("<>"),
            _ => None,
        };
        if let Some(punct) = punct {
            tokens.push(Token::Punct(punct));
            i += 2;
            continue;
        }
        let punct = match c {
            '[' => "[",
            ']' => "]",
            '(' => "(",
            ')' => ")",
            '{' => "{",
            '}' => "}",
            ',' => ",",
            '=' => "=",
            ':' => ":",
            '@' => "@",
            '#' => "#",
            '$' => "$",
            '.' => ".",
            '<' => "<",
            '>' => ">",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            _ => {
                return Err(DbError::Serialization(format!(
                    "unexpected character '{}'",
                    c
                )))
            }
        };
        tokens.push(Token::Punct(punct));
        i += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.at)
            .cloned()
            .ok_or_else(|| DbError::Serialization("unexpected end of input".into()))?;
        self.at += 1;
        Ok(token)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.at += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(DbError::Serialization(format!(
                "expected '{}' at token {}",
                punct, self.at
            )))
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.at == self.tokens.len() {
            Ok(())
        } else {
            Err(DbError::Serialization(format!(
                "trailing input at token {}",
                self.at
            )))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(name) => Ok(name),
            token => Err(DbError::Serialization(format!(
                "expected identifier, found {:?}",
                token
            ))),
        }
    }

    fn integer(&mut self) -> Result<i64> {
        let negative = self.eat_punct("-");
        match self.next()? {
            Token::Number(text) => {
                let value: i64 = text
                    .parse()
                    .map_err(|_| DbError::Serialization(format!("bad integer '{}'", text)))?;
                Ok(if negative { -value } else { value })
            }
            token => Err(DbError::Serialization(format!(
                "expected integer, found {:?}",
                token
            ))),
        }
    }

    // --------------------------------------------------------------
    // Nodes
    // --------------------------------------------------------------

    fn node(&mut self) -> Result<Arc<AlgNode>> {
        let tag = self.ident()?;
        self.expect_punct("[")?;
        let mut params = BTreeMap::new();
        if !self.eat_punct("]") {
            loop {
                let name = self.ident()?;
                self.expect_punct("=")?;
                let value = self.param(&tag, &name)?;
                params.insert(name, value);
                if self.eat_punct("]") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        let mut inputs = Vec::new();
        if self.eat_punct("(") {
            if !self.eat_punct(")") {
                loop {
                    inputs.push(self.node()?);
                    if self.eat_punct(")") {
                        break;
                    }
                    self.expect_punct(",")?;
                }
            }
        }
        assemble(&tag, params, inputs)
    }

    /// Parses one parameter; the expected type follows from (tag, name).
    fn param(&mut self, tag: &str, name: &str) -> Result<ParamValue> {
        match expected_param_type(tag, name) {
            ParamType::Integer => Ok(ParamValue::Integer(self.integer()?)),
            ParamType::Boolean => {
                let ident = self.ident()?;
                match ident.as_str() {
                    "true" => Ok(ParamValue::Boolean(true)),
                    "false" => Ok(ParamValue::Boolean(false)),
                    _ => Err(DbError::Serialization(format!(
                        "expected boolean, found '{}'",
                        ident
                    ))),
                }
            }
            ParamType::Str => match self.next()? {
                Token::Text(text) => Ok(ParamValue::Str(text)),
                token => Err(DbError::Serialization(format!(
                    "expected string, found {:?}",
                    token
                ))),
            },
            ParamType::Literal => Ok(ParamValue::Literal(self.literal()?)),
            ParamType::Field => {
                self.expect_punct("#")?;
                let index = self.integer()?;
                Ok(ParamValue::Field(format!("#{}", index)))
            }
            ParamType::Rex => Ok(ParamValue::Rex(self.rex()?)),
            ParamType::Entity => {
                let namespace = self.integer()? as u64;
                self.expect_punct(".")?;
                let name = self.ident()?;
                self.expect_punct("@")?;
                let id = self.integer()? as u64;
                Ok(ParamValue::Entity(EntityRef {
                    id,
                    namespace,
                    name,
                }))
            }
            ParamType::List(element) => self.param_list(*element),
        }
    }

    fn param_list(&mut self, element: ParamType) -> Result<ParamValue> {
        self.expect_punct("[")?;
        let mut elements = Vec::new();
        if !self.eat_punct("]") {
            loop {
                let value = self.param_of_type(&element)?;
                let alias = if matches!(self.peek(), Some(Token::Ident(kw)) if kw == "AS") {
                    self.at += 1;
                    Some(self.ident()?)
                } else {
                    None
                };
                elements.push(ParamElement { value, alias });
                if self.eat_punct("]") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        Ok(ParamValue::List(elements))
    }

    fn param_of_type(&mut self, ty: &ParamType) -> Result<ParamValue> {
        match ty {
            ParamType::Integer => Ok(ParamValue::Integer(self.integer()?)),
            ParamType::Boolean => {
                let ident = self.ident()?;
                Ok(ParamValue::Boolean(ident == "true"))
            }
            ParamType::Str => match self.next()? {
                Token::Text(text) => Ok(ParamValue::Str(text)),
                token => Err(DbError::Serialization(format!(
                    "expected string, found {:?}",
                    token
                ))),
            },
            ParamType::Literal => Ok(ParamValue::Literal(self.literal()?)),
            ParamType::Field => {
                self.expect_punct("#")?;
                let index = self.integer()?;
                Ok(ParamValue::Field(format!("#{}", index)))
            }
            ParamType::Rex => Ok(ParamValue::Rex(self.rex()?)),
            ParamType::Entity => Err(DbError::Serialization(
                "entity references cannot appear in lists".into(),
            )),
            ParamType::List(element) => self.param_list((**element).clone()),
        }
    }

    // --------------------------------------------------------------
    // Rex expressions and literals
    // --------------------------------------------------------------

    fn rex(&mut self) -> Result<RexNode> {
        match self.peek().cloned() {
            Some(Token::Punct("#")) => {
                self.at += 1;
                let index = self.integer()?;
                Ok(RexNode::Field(index as usize))
            }
            Some(Token::Punct("$")) => {
                self.at += 1;
                let mut path = self.ident()?;
                while self.eat_punct(".") {
                    path.push('.');
                    path.push_str(&self.ident()?);
                }
                Ok(RexNode::NamedField(path))
            }
            Some(Token::Ident(ident)) => {
                // NULL / true / false are literals; every other identifier
                // followed by '(' is an operator call.
                if let Some(op) = RexOp::from_tag(&ident) {
                    self.at += 1;
                    return self.rex_call(op);
                }
                Ok(RexNode::Literal(self.literal()?))
            }
            Some(Token::Punct(punct)) => {
                if let Some(op) = RexOp::from_tag(punct) {
                    // '-' is ambiguous: call when followed by '(', negative
                    // literal otherwise.
                    if punct == "-"
                        && !matches!(self.tokens.get(self.at + 1), Some(Token::Punct("(")))
                    {
                        return Ok(RexNode::Literal(self.literal()?));
                    }
                    self.at += 1;
                    return self.rex_call(op);
                }
                Ok(RexNode::Literal(self.literal()?))
            }
            _ => Ok(RexNode::Literal(self.literal()?)),
        }
    }

    fn rex_call(&mut self, op: RexOp) -> Result<RexNode> {
        self.expect_punct("(")?;
        let mut operands = Vec::new();
        if !self.eat_punct(")") {
            loop {
                operands.push(self.rex()?);
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        Ok(RexNode::Call { op, operands })
    }

    fn literal(&mut self) -> Result<PolyValue> {
        match self.next()? {
            Token::Ident(ident) => match ident.as_str() {
                "NULL" => Ok(PolyValue::Null),
                "true" => Ok(PolyValue::Boolean(true)),
                "false" => Ok(PolyValue::Boolean(false)),
                _ => Err(DbError::Serialization(format!(
                    "unexpected identifier '{}' in literal",
                    ident
                ))),
            },
            Token::Number(text) => parse_number(&text, false),
            Token::Text(text) => Ok(PolyValue::Text(text)),
            Token::Punct("-") => match self.next()? {
                Token::Number(text) => parse_number(&text, true),
                token => Err(DbError::Serialization(format!(
                    "expected number after '-', found {:?}",
                    token
                ))),
            },
            Token::Punct("[") => {
                let mut items = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        items.push(self.literal()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(PolyValue::Array(items))
            }
            Token::Punct("{") => {
                let mut map = BTreeMap::new();
                if !self.eat_punct("}") {
                    loop {
                        let key = match self.next()? {
                            Token::Ident(key) => key,
                            Token::Text(key) => key,
                            token => {
                                return Err(DbError::Serialization(format!(
                                    "expected document key, found {:?}",
                                    token
                                )))
                            }
                        };
                        self.expect_punct(":")?;
                        map.insert(key, self.literal()?);
                        if self.eat_punct("}") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(PolyValue::Document(map))
            }
            token => Err(DbError::Serialization(format!(
                "unexpected token {:?} in literal",
                token
            ))),
        }
    }
}

fn parse_number(text: &str, negative: bool) -> Result<PolyValue> {
    if text.contains('.') {
        let value: f64 = text
            .parse()
            .map_err(|_| DbError::Serialization(format!("bad float '{}'", text)))?;
        Ok(PolyValue::Float(if negative { -value } else { value }))
    } else {
        let value: i64 = text
            .parse()
            .map_err(|_| DbError::Serialization(format!("bad integer '{}'", text)))?;
        Ok(PolyValue::Integer(if negative { -value } else { value }))
    }
}

// ============================================================================
// Parameter typing and node assembly
// ============================================================================

#[derive(Debug, Clone)]
enum ParamType {
    Integer,
    Boolean,
    Str,
    Literal,
    Field,
    Rex,
    Entity,
    List(Box<ParamType>),
}

fn expected_param_type(tag: &str, name: &str) -> ParamType {
    let base = tag.splitn(2, '_').nth(1).unwrap_or(tag);
    match (base, name) {
        (_, "adapter") | (_, "offset") | (_, "fetch") => ParamType::Integer,
        (_, "all") => ParamType::Boolean,
        (_, "entity") => ParamType::Entity,
        (_, "condition") => ParamType::Rex,
        ("SCAN", "fields") | ("VALUES", "fields") => {
            ParamType::List(Box::new(ParamType::Str))
        }
        ("VALUES", "tuples") => {
            ParamType::List(Box::new(ParamType::List(Box::new(ParamType::Literal))))
        }
        ("VALUES", "documents") | ("VALUES", "nodes") | ("VALUES", "edges") => {
            ParamType::List(Box::new(ParamType::Literal))
        }
        ("PROJECT", "exprs") | ("MODIFY", "sources") => {
            ParamType::List(Box::new(ParamType::Rex))
        }
        ("AGGREGATE", "group") => ParamType::List(Box::new(ParamType::Field)),
        ("AGGREGATE", "calls")
        | ("SORT", "collation")
        | ("MODIFY", "targets")
        | ("MATCH", "labels") => ParamType::List(Box::new(ParamType::Str)),
        _ => ParamType::Str,
    }
}

fn get_param<'a>(
    params: &'a BTreeMap<String, ParamValue>,
    name: &str,
    tag: &str,
) -> Result<&'a ParamValue> {
    params.get(name).ok_or_else(|| {
        DbError::Serialization(format!("{} missing parameter '{}'", tag, name))
    })
}

fn expect_list<'a>(value: &'a ParamValue, what: &str) -> Result<&'a Vec<ParamElement>> {
    match value {
        ParamValue::List(elements) => Ok(elements),
        _ => Err(DbError::Serialization(format!("{} must be a LIST", what))),
    }
}

fn expect_str(value: &ParamValue, what: &str) -> Result<String> {
    match value {
        ParamValue::Str(text) => Ok(text.clone()),
        _ => Err(DbError::Serialization(format!("{} must be a STRING", what))),
    }
}

fn expect_rex(value: &ParamValue, what: &str) -> Result<RexNode> {
    match value {
        ParamValue::Rex(rex) => Ok(rex.clone()),
        _ => Err(DbError::Serialization(format!("{} must be a REX", what))),
    }
}

fn expect_entity(value: &ParamValue, what: &str) -> Result<EntityRef> {
    match value {
        ParamValue::Entity(entity) => Ok(entity.clone()),
        _ => Err(DbError::Serialization(format!("{} must be an ENTITY", what))),
    }
}

fn expect_literals(value: &ParamValue, what: &str) -> Result<Vec<PolyValue>> {
    expect_list(value, what)?
        .iter()
        .map(|e| match &e.value {
            ParamValue::Literal(v) => Ok(v.clone()),
            _ => Err(DbError::Serialization(format!(
                "{} elements must be LITERAL",
                what
            ))),
        })
        .collect()
}

fn expect_strings(value: &ParamValue, what: &str) -> Result<Vec<String>> {
    expect_list(value, what)?
        .iter()
        .map(|e| expect_str(&e.value, what))
        .collect()
}

fn parse_collation_text(text: &str) -> Result<FieldCollation> {
    let text = text.trim();
    let (body, descending) = match text.strip_suffix(" DESC") {
        Some(body) => (body, true),
        None => (text, false),
    };
    let index: usize = body
        .strip_prefix('#')
        .and_then(|i| i.parse().ok())
        .ok_or_else(|| DbError::Serialization(format!("bad collation '{}'", text)))?;
    Ok(FieldCollation {
        field: index,
        descending,
    })
}

fn parse_aggregate_call(text: &str) -> Result<AggregateCall> {
    // Shape: FUNC(#i) AS alias  or  FUNC(*) AS alias
    let (call, alias) = text
        .split_once(" AS ")
        .ok_or_else(|| DbError::Serialization(format!("bad aggregate call '{}'", text)))?;
    let open = call
        .find('(')
        .ok_or_else(|| DbError::Serialization(format!("bad aggregate call '{}'", text)))?;
    let function = match &call[..open] {
        "COUNT" => AggFunction::Count,
        "SUM" => AggFunction::Sum,
        "MIN" => AggFunction::Min,
        "MAX" => AggFunction::Max,
        "AVG" => AggFunction::Avg,
        other => {
            return Err(DbError::Serialization(format!(
                "unknown aggregate function '{}'",
                other
            )))
        }
    };
    let arg = call[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| DbError::Serialization(format!("bad aggregate call '{}'", text)))?;
    let field = match arg {
        "*" => None,
        _ => Some(
            arg.strip_prefix('#')
                .and_then(|i| i.parse().ok())
                .ok_or_else(|| {
                    DbError::Serialization(format!("bad aggregate argument '{}'", arg))
                })?,
        ),
    };
    Ok(AggregateCall {
        function,
        field,
        alias: alias.to_string(),
    })
}

fn assemble(
    tag: &str,
    params: BTreeMap<String, ParamValue>,
    inputs: Vec<Arc<AlgNode>>,
) -> Result<Arc<AlgNode>> {
    let (prefix, base) = tag
        .split_once('_')
        .ok_or_else(|| DbError::Serialization(format!("tag '{}' has no model prefix", tag)))?;
    let model = model_from_prefix(prefix)
        .ok_or_else(|| DbError::Serialization(format!("unknown model prefix '{}'", prefix)))?;

    let op = match base {
        "SCAN" => AlgOperator::Scan {
            entity: expect_entity(get_param(&params, "entity", tag)?, "entity")?,
            row_type: parse_fields_param(get_param(&params, "fields", tag)?)?,
        },
        "PROJECT" => {
            let elements = expect_list(get_param(&params, "exprs", tag)?, "exprs")?;
            let mut exprs = Vec::with_capacity(elements.len());
            let mut names = Vec::with_capacity(elements.len());
            for (i, element) in elements.iter().enumerate() {
                exprs.push(expect_rex(&element.value, "exprs element")?);
                names.push(element.alias.clone().unwrap_or_else(|| format!("f{}", i)));
            }
            AlgOperator::Project { exprs, names }
        }
        "FILTER" => AlgOperator::Filter {
            condition: expect_rex(get_param(&params, "condition", tag)?, "condition")?,
        },
        "JOIN" => {
            let kind = match expect_str(get_param(&params, "kind", tag)?, "kind")?.as_str() {
                "INNER" => JoinKind::Inner,
                "LEFT" => JoinKind::Left,
                other => {
                    return Err(DbError::Serialization(format!(
                        "unknown join kind '{}'",
                        other
                    )))
                }
            };
            AlgOperator::Join {
                kind,
                condition: expect_rex(get_param(&params, "condition", tag)?, "condition")?,
            }
        }
        "UNION" | "INTERSECT" | "MINUS" => {
            let all = match get_param(&params, "all", tag)? {
                ParamValue::Boolean(all) => *all,
                _ => return Err(DbError::Serialization("'all' must be BOOLEAN".into())),
            };
            match base {
                "UNION" => AlgOperator::Union { all },
                "INTERSECT" => AlgOperator::Intersect { all },
                _ => AlgOperator::Minus { all },
            }
        }
        "SORT" => {
            let collation = expect_strings(get_param(&params, "collation", tag)?, "collation")?
                .iter()
                .map(|text| parse_collation_text(text))
                .collect::<Result<Vec<_>>>()?;
            let offset = match params.get("offset") {
                Some(ParamValue::Integer(v)) => Some(*v as usize),
                _ => None,
            };
            let fetch = match params.get("fetch") {
                Some(ParamValue::Integer(v)) => Some(*v as usize),
                _ => None,
            };
            AlgOperator::Sort {
                collation,
                offset,
                fetch,
            }
        }
        "AGGREGATE" => {
            let group = expect_list(get_param(&params, "group", tag)?, "group")?
                .iter()
                .map(|e| match &e.value {
                    ParamValue::Field(field) => field
                        .strip_prefix('#')
                        .and_then(|i| i.parse::<usize>().ok())
                        .ok_or_else(|| {
                            DbError::Serialization(format!("bad group field '{}'", field))
                        }),
                    _ => Err(DbError::Serialization("group elements must be FIELD".into())),
                })
                .collect::<Result<Vec<_>>>()?;
            let calls = expect_strings(get_param(&params, "calls", tag)?, "calls")?
                .iter()
                .map(|text| parse_aggregate_call(text))
                .collect::<Result<Vec<_>>>()?;
            AlgOperator::Aggregate { group, calls }
        }
        "VALUES" => match model {
            DataModel::Relational => {
                let row_type = parse_fields_param(get_param(&params, "fields", tag)?)?;
                let tuples = expect_list(get_param(&params, "tuples", tag)?, "tuples")?
                    .iter()
                    .map(|row| expect_literals(&row.value, "tuple"))
                    .collect::<Result<Vec<_>>>()?;
                AlgOperator::Values { row_type, tuples }
            }
            DataModel::Document => AlgOperator::DocumentValues {
                documents: expect_literals(get_param(&params, "documents", tag)?, "documents")?,
            },
            DataModel::Graph => AlgOperator::LpgValues {
                nodes: expect_literals(get_param(&params, "nodes", tag)?, "nodes")?,
                edges: expect_literals(get_param(&params, "edges", tag)?, "edges")?,
            },
        },
        "MODIFY" => {
            let operation = match expect_str(get_param(&params, "operation", tag)?, "operation")?
                .as_str()
            {
                "INSERT" => ModifyOperation::Insert,
                "UPDATE" => ModifyOperation::Update,
                "DELETE" => ModifyOperation::Delete,
                other => {
                    return Err(DbError::Serialization(format!(
                        "unknown modify operation '{}'",
                        other
                    )))
                }
            };
            let update_targets = match params.get("targets") {
                Some(value) => expect_strings(value, "targets")?,
                None => Vec::new(),
            };
            let update_sources = match params.get("sources") {
                Some(value) => expect_list(value, "sources")?
                    .iter()
                    .map(|e| expect_rex(&e.value, "sources element"))
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            AlgOperator::Modify {
                entity: expect_entity(get_param(&params, "entity", tag)?, "entity")?,
                operation,
                update_targets,
                update_sources,
            }
        }
        "IDENTIFIER" => AlgOperator::Identifier {
            entity: expect_entity(get_param(&params, "entity", tag)?, "entity")?,
        },
        "TRANSFORMER" => {
            let parse_model = |text: String| match text.as_str() {
                "RELATIONAL" => Ok(DataModel::Relational),
                "DOCUMENT" => Ok(DataModel::Document),
                "GRAPH" => Ok(DataModel::Graph),
                other => Err(DbError::Serialization(format!(
                    "unknown data model '{}'",
                    other
                ))),
            };
            AlgOperator::Transformer {
                from: parse_model(expect_str(get_param(&params, "from", tag)?, "from")?)?,
                to: parse_model(expect_str(get_param(&params, "to", tag)?, "to")?)?,
            }
        }
        "MATCH" => {
            let kind = match expect_str(get_param(&params, "kind", tag)?, "kind")?.as_str() {
                "NODE" => MatchKind::Node,
                "EDGE" => MatchKind::Edge,
                other => {
                    return Err(DbError::Serialization(format!(
                        "unknown match kind '{}'",
                        other
                    )))
                }
            };
            AlgOperator::Match {
                kind,
                labels: expect_strings(get_param(&params, "labels", tag)?, "labels")?,
                alias: expect_str(get_param(&params, "alias", tag)?, "alias")?,
            }
        }
        "UNWIND" => AlgOperator::Unwind {
            field: expect_str(get_param(&params, "field", tag)?, "field")?,
        },
        other => {
            return Err(DbError::Serialization(format!(
                "unknown operator tag '{}'",
                other
            )))
        }
    };

    let convention = match params.get("adapter") {
        Some(ParamValue::Integer(adapter)) => Convention::Physical(*adapter as u64),
        _ => Convention::Logical,
    };
    let traits = AlgTraitSet {
        model,
        convention,
        collation: Vec::new(),
    };
    Ok(AlgNode::new(op, traits, inputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::builder::AlgBuilder;

    fn entity() -> EntityRef {
        EntityRef {
            id: 3,
            namespace: 1,
            name: "t".into(),
        }
    }

    fn assert_round_trip(node: &Arc<AlgNode>) {
        let text = print(node);
        let reparsed = parse(&text).unwrap_or_else(|e| panic!("parse of '{}' failed: {}", text, e));
        assert_eq!(
            reparsed.compare_string(),
            node.compare_string(),
            "text round trip of '{}'",
            text
        );

        let json = to_json(node);
        let from = from_json(&json).unwrap();
        assert_eq!(from.compare_string(), node.compare_string());
    }

    #[test]
    fn test_scan_filter_project_round_trip() {
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x", "y"]),
            )
            .filter(RexNode::and(vec![
                RexNode::eq(RexNode::Field(2), RexNode::literal(1)),
                RexNode::call(RexOp::Gt, vec![RexNode::Field(3), RexNode::literal(-5)]),
            ]))
            .unwrap()
            .project(
                vec![RexNode::Field(2), RexNode::literal("tag")],
                vec!["x".into(), "tag".into()],
            )
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }

    #[test]
    fn test_join_round_trip() {
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x"]),
            )
            .scan(
                DataModel::Relational,
                EntityRef {
                    id: 4,
                    namespace: 1,
                    name: "u".into(),
                },
                AlgRowType::versioned_relational(["y"]),
            )
            .join(
                JoinKind::Left,
                RexNode::eq(RexNode::Field(2), RexNode::Field(5)),
            )
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }

    #[test]
    fn test_set_ops_round_trip() {
        for build in [0, 1, 2] {
            let mut builder = AlgBuilder::logical();
            builder
                .scan(
                    DataModel::Relational,
                    entity(),
                    AlgRowType::versioned_relational(["x"]),
                )
                .scan(
                    DataModel::Relational,
                    entity(),
                    AlgRowType::versioned_relational(["x"]),
                );
            match build {
                0 => builder.union(true).unwrap(),
                1 => builder.intersect(false).unwrap(),
                _ => builder.minus(false).unwrap(),
            };
            assert_round_trip(&builder.build().unwrap());
        }
    }

    #[test]
    fn test_sort_aggregate_round_trip() {
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x", "y"]),
            )
            .aggregate(
                vec![2],
                vec![
                    AggregateCall {
                        function: AggFunction::Count,
                        field: None,
                        alias: "n".into(),
                    },
                    AggregateCall {
                        function: AggFunction::Sum,
                        field: Some(3),
                        alias: "total".into(),
                    },
                ],
            )
            .unwrap()
            .sort(
                vec![FieldCollation {
                    field: 1,
                    descending: true,
                }],
                Some(10),
                Some(5),
            )
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }

    #[test]
    fn test_relational_values_round_trip() {
        let plan = AlgBuilder::logical()
            .values(
                AlgRowType::new(vec![
                    AlgField::new("x", PolyType::Integer),
                    AlgField::new("s", PolyType::Text),
                ]),
                vec![
                    vec![PolyValue::Integer(1), PolyValue::Text("a".into())],
                    vec![PolyValue::Integer(2), PolyValue::Null],
                ],
            )
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }

    #[test]
    fn test_document_modify_round_trip() {
        let doc = PolyValue::document([
            ("a", PolyValue::Integer(1)),
            (
                "address",
                PolyValue::document([("city", PolyValue::Text("basel".into()))]),
            ),
            ("tags", PolyValue::Array(vec![PolyValue::Integer(1), PolyValue::Integer(2)])),
        ]);
        let plan = AlgBuilder::logical()
            .document_values(vec![doc])
            .modify(entity(), ModifyOperation::Insert, vec![], vec![])
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }

    #[test]
    fn test_graph_round_trip() {
        let node_doc = PolyValue::document([
            ("label", PolyValue::Text("person".into())),
            ("name", PolyValue::Text("ada".into())),
        ]);
        let plan = AlgBuilder::logical()
            .lpg_values(vec![node_doc], vec![])
            .graph_match(MatchKind::Node, vec!["person".into()], "n")
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }

    #[test]
    fn test_identifier_transformer_unwind_round_trip() {
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Document,
                entity(),
                AlgRowType::versioned_document(),
            )
            .identifier(entity())
            .unwrap()
            .unwind("d.tags")
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);

        let mut builder = AlgBuilder::physical(9);
        for name in ["n", "np", "e", "ep"] {
            builder.scan(
                DataModel::Relational,
                EntityRef {
                    id: 1,
                    namespace: 1,
                    name: name.into(),
                },
                AlgRowType::versioned_relational(["k"]),
            );
        }
        let transform = builder
            .transformer(DataModel::Relational, DataModel::Graph, 4)
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&transform);
    }

    #[test]
    fn test_update_modify_round_trip() {
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x"]),
            )
            .modify(
                entity(),
                ModifyOperation::Update,
                vec!["x".into()],
                vec![RexNode::literal(2)],
            )
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }

    #[test]
    fn test_physical_convention_round_trip() {
        let plan = AlgBuilder::physical(42)
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x"]),
            )
            .build()
            .unwrap();
        let text = print(&plan);
        assert!(text.contains("adapter=42"), "{}", text);
        assert_round_trip(&plan);
    }

    #[test]
    fn test_visible_filter_round_trip() {
        let plan = AlgBuilder::logical()
            .scan(
                DataModel::Relational,
                entity(),
                AlgRowType::versioned_relational(["x"]),
            )
            .filter(RexNode::call(
                RexOp::Visible,
                vec![
                    RexNode::Field(1),
                    RexNode::literal(17),
                    RexNode::literal(9),
                ],
            ))
            .unwrap()
            .build()
            .unwrap();
        assert_round_trip(&plan);
    }
}
