//! Queryable field declarations.
//!
//! Each resource kind declares an [`EntitySchema`]: the fields a filter may
//! reference, their types, and which of them may order a paginated listing.

use chrono::DateTime;
use serde_json::Value;

use ledgerflow_core::bigint::parse_bigint;

use super::expr::Operator;
use crate::error::{StorageError, StorageResult};

/// How listings ordered by a field are paginated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStrategy {
    /// Row offset; works for any ordering.
    Offset,
    /// Seek on the column value; needs a totally ordered, integer-mappable column.
    Column,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    /// RFC 3339 timestamps.
    Date,
    /// Integers of any size (JSON numbers or decimal strings).
    Numeric,
    Boolean,
    /// A map addressed as `field[key]`, whose values have the inner type.
    Map(Box<FieldType>),
}

impl FieldType {
    pub fn map_of(inner: FieldType) -> Self {
        Self::Map(Box::new(inner))
    }

    pub fn operators(&self) -> Vec<Operator> {
        use Operator::*;
        match self {
            Self::String => vec![Match, Like],
            Self::Date | Self::Numeric => vec![Match, Lt, Gt, Lte, Gte],
            Self::Boolean => vec![Match],
            Self::Map(inner) => {
                let mut ops = inner.operators();
                for op in [Match, Exists] {
                    if !ops.contains(&op) {
                        ops.push(op);
                    }
                }
                ops
            }
        }
    }

    pub fn allows(&self, operator: Operator) -> bool {
        self.operators().contains(&operator)
    }

    pub fn is_indexable(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    pub fn validate(&self, operator: Operator, value: &Value) -> Result<(), String> {
        if operator == Operator::Exists {
            return match value {
                Value::Bool(_) => Ok(()),
                other => Err(format!("$exists expects a boolean, got {other}")),
            };
        }
        match (self, value) {
            (Self::Map(inner), value) => inner.validate(operator, value),
            (Self::String, Value::String(_)) => Ok(()),
            (Self::Boolean, Value::Bool(_)) => Ok(()),
            (Self::Date, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|_| ())
                .map_err(|e| format!("invalid date '{s}': {e}")),
            (Self::Numeric, Value::Number(_)) => Ok(()),
            (Self::Numeric, v @ Value::String(s)) => parse_bigint(v)
                .map(|_| ())
                .ok_or_else(|| format!("invalid number '{s}'")),
            (ty, other) => Err(format!("expected {}, got {other}", ty.describe())),
        }
    }

    pub fn pagination_strategy(&self) -> Option<PaginationStrategy> {
        match self {
            Self::Date | Self::Numeric => Some(PaginationStrategy::Column),
            Self::String | Self::Boolean => Some(PaginationStrategy::Offset),
            Self::Map(_) => None,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Date => "a date",
            Self::Numeric => "a number",
            Self::Boolean => "a boolean",
            Self::Map(_) => "a map value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub aliases: Vec<String>,
    pub field_type: FieldType,
    pub paginated: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            field_type,
            paginated: false,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn paginated(mut self) -> Self {
        self.paginated = true;
        self
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitySchema {
    fields: Vec<Field>,
}

impl EntitySchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look a field up by name or alias.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.is_named(name))
    }

    /// Resolve a filter key to its field, splitting `field[sub]` for
    /// indexable fields. Returns the sub-key when one was given.
    pub fn resolve_key<'k>(&self, key: &'k str) -> Option<(&Field, Option<&'k str>)> {
        if let Some((base, rest)) = key.split_once('[') {
            if let Some(sub) = rest.strip_suffix(']') {
                if let Some(field) = self.get(base).filter(|f| f.field_type.is_indexable()) {
                    return Some((field, Some(sub)));
                }
            }
        }
        self.get(key)
            .filter(|f| !f.field_type.is_indexable())
            .map(|f| (f, None))
    }

    /// Find the pagination strategy for ordering by `column`.
    pub fn pagination_strategy(&self, column: &str) -> StorageResult<(&Field, PaginationStrategy)> {
        let field = self
            .get(column)
            .filter(|f| f.paginated)
            .ok_or_else(|| StorageError::NotPaginatedField(column.to_string()))?;
        let strategy = field
            .field_type
            .pagination_strategy()
            .ok_or_else(|| StorageError::NotPaginatedField(column.to_string()))?;
        Ok((field, strategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn schema() -> EntitySchema {
        EntitySchema::new(vec![
            Field::new("address", FieldType::String).paginated(),
            Field::new("id", FieldType::Numeric).paginated(),
            Field::new("insertion_date", FieldType::Date)
                .with_aliases(&["inserted_at"])
                .paginated(),
            Field::new("reverted", FieldType::Boolean),
            Field::new("metadata", FieldType::map_of(FieldType::String)).paginated(),
        ])
    }

    #[test]
    fn operator_sets_per_type() {
        use Operator::*;
        assert_eq!(FieldType::String.operators(), vec![Match, Like]);
        assert_eq!(FieldType::Date.operators(), vec![Match, Lt, Gt, Lte, Gte]);
        assert_eq!(FieldType::Boolean.operators(), vec![Match]);
        assert_eq!(
            FieldType::map_of(FieldType::Numeric).operators(),
            vec![Match, Lt, Gt, Lte, Gte, Exists]
        );
        assert_eq!(FieldType::map_of(FieldType::String).operators(), vec![Match, Like, Exists]);
    }

    #[test]
    fn values_are_checked_against_the_type() {
        assert!(FieldType::Date.validate(Operator::Lt, &json!("2024-01-01T00:00:00Z")).is_ok());
        assert!(FieldType::Date.validate(Operator::Lt, &json!("yesterday")).is_err());
        assert!(FieldType::Numeric.validate(Operator::Gt, &json!(12)).is_ok());
        assert!(
            FieldType::Numeric
                .validate(Operator::Gt, &json!("100000000000000000000000"))
                .is_ok()
        );
        assert!(FieldType::Numeric.validate(Operator::Gt, &json!("ten")).is_err());
        assert!(FieldType::Boolean.validate(Operator::Match, &json!("true")).is_err());
        assert!(
            FieldType::map_of(FieldType::String)
                .validate(Operator::Exists, &json!(true))
                .is_ok()
        );
        assert!(
            FieldType::map_of(FieldType::String)
                .validate(Operator::Match, &json!(1))
                .is_err()
        );
    }

    #[test]
    fn keys_resolve_by_name_alias_and_index() {
        let schema = schema();
        assert_eq!(schema.resolve_key("inserted_at").unwrap().0.name, "insertion_date");
        let (field, sub) = schema.resolve_key("metadata[role]").unwrap();
        assert_eq!((field.name.as_str(), sub), ("metadata", Some("role")));
        assert!(schema.resolve_key("address[x]").is_none());
        assert!(schema.resolve_key("metadata").is_none());
        assert!(schema.resolve_key("unknown").is_none());
    }

    #[test]
    fn strategy_follows_the_column_type() {
        let schema = schema();
        assert_eq!(schema.pagination_strategy("id").unwrap().1, PaginationStrategy::Column);
        assert_eq!(
            schema.pagination_strategy("inserted_at").unwrap().1,
            PaginationStrategy::Column
        );
        assert_eq!(schema.pagination_strategy("address").unwrap().1, PaginationStrategy::Offset);

        for column in ["reverted", "metadata", "nope"] {
            let err = schema.pagination_strategy(column).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotPaginatedField, "{column}");
        }
    }
}
