//! Resource handlers for the ledger-scoped read models.
//!
//! Each handler plugs one table family of a bucket into the generic
//! repository: its schema, base dataset, filter resolution and expansions.

pub mod accounts;
pub mod logs;
pub mod transactions;
pub mod volumes;

pub use accounts::{AccountRow, AccountsHandler};
pub use logs::{LogRow, LogsHandler};
pub use transactions::{TransactionRow, TransactionsHandler};
pub use volumes::{VolumesHandler, VolumesOptions, VolumesRow};

use chrono::{DateTime, Utc};
use ledgerflow_core::Metadata;
use ledgerflow_core::bigint::parse_bigint;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};
use crate::query::{FieldType, Operator};
use crate::sql::{Fragment, SqlValue, quote_ident};

/// Schema-qualified table name inside a bucket.
pub(crate) fn table(bucket: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(bucket), quote_ident(name))
}

/// `metadata[foo]` -> `foo`.
pub(crate) fn sub_key(property: &str) -> Option<&str> {
    property
        .split_once('[')
        .and_then(|(_, rest)| rest.strip_suffix(']'))
}

/// Convert a validated filter value to a bind value of the field's type.
pub(crate) fn typed_value(field_type: &FieldType, value: &Value) -> StorageResult<SqlValue> {
    let converted = match (field_type, value) {
        (FieldType::Map(inner), value) => return typed_value(inner, value),
        (FieldType::String, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        (FieldType::Boolean, Value::Bool(b)) => Some(SqlValue::Bool(*b)),
        (FieldType::Numeric, value) => parse_bigint(value).map(SqlValue::Numeric),
        (FieldType::Date, Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|at| SqlValue::Timestamp(at.with_timezone(&Utc))),
        _ => None,
    };
    converted.ok_or_else(|| StorageError::invalid_query(format!("unexpected filter value {value}")))
}

/// `<column> <op> ?` for scalar fields.
pub(crate) fn compare(
    column: &str,
    field_type: &FieldType,
    operator: Operator,
    value: &Value,
) -> StorageResult<Fragment> {
    let op = operator.sql().ok_or_else(|| {
        StorageError::invalid_query(format!("operator '{}' needs a map field", operator.as_str()))
    })?;
    let placeholder = match field_type {
        FieldType::Numeric => "?::numeric",
        FieldType::Map(inner) if **inner == FieldType::Numeric => "?::numeric",
        _ => "?",
    };
    Ok(Fragment::new(format!("{column} {op} {placeholder}")).bind(typed_value(field_type, value)?))
}

/// Predicate on one key of a jsonb metadata column.
pub(crate) fn metadata_filter(
    column: &str,
    operator: Operator,
    key: &str,
    value: &Value,
) -> StorageResult<Fragment> {
    match operator {
        Operator::Exists => {
            let negate = value == &Value::Bool(false);
            let test = if negate { "is null" } else { "is not null" };
            Ok(Fragment::new(format!("{column} -> ? {test}")).bind(key))
        }
        Operator::Match => {
            let mut object = Map::new();
            object.insert(key.to_string(), value.clone());
            Ok(Fragment::new(format!("{column} @> ?::jsonb")).bind(Value::Object(object)))
        }
        Operator::Like => Ok(Fragment::new(format!("{column} ->> ? like ?"))
            .bind(key)
            .bind(typed_value(&FieldType::String, value)?)),
        other => Err(StorageError::invalid_query(format!(
            "operator '{}' is not supported on metadata",
            other.as_str()
        ))),
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> StorageResult<Value> {
    serde_json::to_value(value).map_err(|e| StorageError::MalformedRow(e.to_string()))
}

pub(crate) fn metadata_from(value: Value) -> StorageResult<Metadata> {
    match value {
        Value::Null => Ok(Metadata::new()),
        value => serde_json::from_value(value).map_err(|e| StorageError::MalformedRow(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;
    use serde_json::json;

    #[test]
    fn sub_keys() {
        assert_eq!(sub_key("metadata[role]"), Some("role"));
        assert_eq!(sub_key("balance[USD/2]"), Some("USD/2"));
        assert_eq!(sub_key("metadata"), None);
    }

    #[test]
    fn scalar_comparisons_are_typed() {
        let f = compare("\"id\"", &FieldType::Numeric, Operator::Gt, &json!(5)).unwrap();
        assert_eq!(f.sql(), "\"id\" > ?::numeric");
        assert_eq!(f.args(), &[SqlValue::Numeric(BigInt::from(5))]);

        let f = compare("\"timestamp\"", &FieldType::Date, Operator::Lte, &json!("2024-01-01T00:00:00Z"))
            .unwrap();
        assert!(matches!(f.args()[0], SqlValue::Timestamp(_)));

        let err = compare("\"id\"", &FieldType::Numeric, Operator::Exists, &json!(true)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[test]
    fn metadata_predicates() {
        let f = metadata_filter("metadata", Operator::Match, "role", &json!("admin")).unwrap();
        assert_eq!(f.sql(), "metadata @> ?::jsonb");
        assert_eq!(f.args(), &[SqlValue::Json(json!({"role": "admin"}))]);

        let f = metadata_filter("metadata", Operator::Exists, "vip", &json!(false)).unwrap();
        assert_eq!(f.sql(), "metadata -> ? is null");

        assert!(metadata_filter("metadata", Operator::Gt, "k", &json!("v")).is_err());
    }

    #[test]
    fn null_metadata_is_empty() {
        assert!(metadata_from(Value::Null).unwrap().is_empty());
        assert_eq!(metadata_from(json!({"a": "b"})).unwrap()["a"], "b");
        assert!(metadata_from(json!({"a": 1})).is_err());
    }
}
