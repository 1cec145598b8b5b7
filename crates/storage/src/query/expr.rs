//! Filter expression tree.
//!
//! The wire format is a JSON boolean tree:
//!
//! ```json
//! {"$and": [{"$match": {"metadata[role]": "admin"}}, {"$not": {"$lt": {"timestamp": "2024-01-01T00:00:00Z"}}}]}
//! ```
//!
//! Each leaf is `{"<operator>": {"<key>": <value>}}`. Parsing and
//! serialization are inverse, so the tree survives a trip through a cursor.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};
use crate::sql::Fragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Match,
    Exists,
    Like,
    Lt,
    Gt,
    Lte,
    Gte,
}

impl Operator {
    pub const ALL: [Operator; 7] = [
        Operator::Match,
        Operator::Exists,
        Operator::Like,
        Operator::Lt,
        Operator::Gt,
        Operator::Lte,
        Operator::Gte,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "$match",
            Self::Exists => "$exists",
            Self::Like => "$like",
            Self::Lt => "$lt",
            Self::Gt => "$gt",
            Self::Lte => "$lte",
            Self::Gte => "$gte",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }

    /// The SQL comparison operator, if the operator is a comparison.
    pub fn sql(&self) -> Option<&'static str> {
        match self {
            Self::Match => Some("="),
            Self::Like => Some("like"),
            Self::Lt => Some("<"),
            Self::Gt => Some(">"),
            Self::Lte => Some("<="),
            Self::Gte => Some(">="),
            Self::Exists => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryExpr {
    And(Vec<QueryExpr>),
    Or(Vec<QueryExpr>),
    Not(Box<QueryExpr>),
    Leaf {
        operator: Operator,
        key: String,
        value: Value,
    },
}

impl QueryExpr {
    pub fn leaf(operator: Operator, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Leaf {
            operator,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(Operator::Match, key, value)
    }

    pub fn exists(key: impl Into<String>, exists: bool) -> Self {
        Self::leaf(Operator::Exists, key, exists)
    }

    /// A leaf on a date field; the value is carried as an RFC 3339 string.
    pub fn date(operator: Operator, key: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::leaf(operator, key, at.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn and(exprs: Vec<QueryExpr>) -> Self {
        Self::And(exprs)
    }

    pub fn or(exprs: Vec<QueryExpr>) -> Self {
        Self::Or(exprs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: QueryExpr) -> Self {
        Self::Not(Box::new(expr))
    }

    /// Visit every leaf, depth first, left to right.
    pub fn walk<F>(&self, visit: &mut F) -> StorageResult<()>
    where
        F: FnMut(Operator, &str, &Value) -> StorageResult<()>,
    {
        match self {
            Self::And(exprs) | Self::Or(exprs) => exprs.iter().try_for_each(|e| e.walk(visit)),
            Self::Not(expr) => expr.walk(visit),
            Self::Leaf {
                operator,
                key,
                value,
            } => visit(*operator, key, value),
        }
    }

    /// Render the tree to SQL, resolving each leaf through `resolve`.
    pub fn build<F>(&self, resolve: &mut F) -> StorageResult<Fragment>
    where
        F: FnMut(Operator, &str, &Value) -> StorageResult<Fragment>,
    {
        match self {
            Self::And(exprs) if exprs.is_empty() => Ok(Fragment::new("true")),
            Self::Or(exprs) if exprs.is_empty() => Ok(Fragment::new("false")),
            Self::And(exprs) => Ok(Fragment::and(Self::build_all(exprs, resolve)?)),
            Self::Or(exprs) => Ok(Fragment::or(Self::build_all(exprs, resolve)?)),
            Self::Not(expr) => Ok(Fragment::not(expr.build(resolve)?)),
            Self::Leaf {
                operator,
                key,
                value,
            } => resolve(*operator, key, value),
        }
    }

    fn build_all<F>(exprs: &[QueryExpr], resolve: &mut F) -> StorageResult<Vec<Fragment>>
    where
        F: FnMut(Operator, &str, &Value) -> StorageResult<Fragment>,
    {
        exprs.iter().map(|e| e.build(resolve)).collect()
    }

    pub fn from_json(value: &Value) -> StorageResult<Self> {
        let (name, body) = single_entry(value, "expression")?;
        match name.as_str() {
            "$and" | "$or" => {
                let items = body.as_array().ok_or_else(|| {
                    StorageError::invalid_query(format!("'{name}' expects an array"))
                })?;
                let exprs = items
                    .iter()
                    .map(Self::from_json)
                    .collect::<StorageResult<Vec<_>>>()?;
                Ok(if name == "$and" {
                    Self::And(exprs)
                } else {
                    Self::Or(exprs)
                })
            }
            "$not" => Ok(Self::Not(Box::new(Self::from_json(body)?))),
            op => {
                let operator = Operator::parse(op).ok_or_else(|| {
                    StorageError::invalid_query(format!("unknown operator '{op}'"))
                })?;
                let (key, value) = single_entry(body, op)?;
                Ok(Self::Leaf {
                    operator,
                    key,
                    value: value.clone(),
                })
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let (name, body) = match self {
            Self::And(exprs) => ("$and", Value::Array(exprs.iter().map(Self::to_json).collect())),
            Self::Or(exprs) => ("$or", Value::Array(exprs.iter().map(Self::to_json).collect())),
            Self::Not(expr) => ("$not", expr.to_json()),
            Self::Leaf {
                operator,
                key,
                value,
            } => {
                let mut leaf = Map::new();
                leaf.insert(key.clone(), value.clone());
                (operator.as_str(), Value::Object(leaf))
            }
        };
        let mut out = Map::new();
        out.insert(name.to_string(), body);
        Value::Object(out)
    }
}

fn single_entry<'v>(value: &'v Value, what: &str) -> StorageResult<(String, &'v Value)> {
    let object = value
        .as_object()
        .ok_or_else(|| StorageError::invalid_query(format!("{what} must be an object")))?;
    let mut entries = object.iter();
    match (entries.next(), entries.next()) {
        (Some((k, v)), None) => Ok((k.clone(), v)),
        _ => Err(StorageError::invalid_query(format!(
            "{what} must have exactly one key, got {}",
            object.len()
        ))),
    }
}

impl Serialize for QueryExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(de::Error::custom)
    }
}
