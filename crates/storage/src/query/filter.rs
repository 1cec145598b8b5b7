//! Filter validation against an entity schema.

use std::collections::BTreeMap;

use serde_json::Value;

use super::expr::QueryExpr;
use super::schema::EntitySchema;
use crate::error::{StorageError, StorageResult};

/// Values each schema field was filtered with, keyed by canonical field name.
///
/// Dataset builders use this to ask "was `X` filtered on (with a value
/// satisfying `p`)?" without walking the expression again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedFilters {
    values: BTreeMap<String, Vec<Value>>,
}

impl ValidatedFilters {
    pub fn is_used(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    /// True when `field` was filtered on with at least one value matching `predicate`.
    pub fn use_filter(&self, field: &str, predicate: impl Fn(&Value) -> bool) -> bool {
        self.values(field).iter().any(predicate)
    }

    pub fn values(&self, field: &str) -> &[Value] {
        self.values.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Check every leaf of `expr` against `schema`.
///
/// Fails with `InvalidQuery` on an unknown key, an operator the field's type
/// does not allow, or a value of the wrong type.
pub fn validate_filters(
    schema: &EntitySchema,
    expr: Option<&QueryExpr>,
) -> StorageResult<ValidatedFilters> {
    let mut out = ValidatedFilters::default();
    let Some(expr) = expr else {
        return Ok(out);
    };

    expr.walk(&mut |operator, key, value| {
        let (field, _) = schema.resolve_key(key).ok_or_else(|| {
            StorageError::invalid_query(format!("unknown key '{key}' when building query"))
        })?;

        if !field.field_type.allows(operator) {
            return Err(StorageError::invalid_query(format!(
                "operator '{}' is not allowed for field '{}'",
                operator.as_str(),
                field.name
            )));
        }

        field
            .field_type
            .validate(operator, value)
            .map_err(|reason| {
                StorageError::invalid_query(format!("invalid value for field '{key}': {reason}"))
            })?;

        out.values
            .entry(field.name.clone())
            .or_default()
            .push(value.clone());
        Ok(())
    })?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::query::expr::Operator;
    use crate::query::schema::{Field, FieldType};
    use serde_json::json;

    fn schema() -> EntitySchema {
        EntitySchema::new(vec![
            Field::new("id", FieldType::Numeric).paginated(),
            Field::new("reference", FieldType::String),
            Field::new("timestamp", FieldType::Date).paginated(),
            Field::new("reverted", FieldType::Boolean),
            Field::new("metadata", FieldType::map_of(FieldType::String)),
        ])
    }

    fn expr(raw: serde_json::Value) -> QueryExpr {
        QueryExpr::from_json(&raw).unwrap()
    }

    #[test]
    fn unknown_key_is_invalid_query() {
        let err = validate_filters(&schema(), Some(&expr(json!({"$gte": {"unknown_field": 1}}))))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
        assert!(err.to_string().contains("unknown key 'unknown_field'"));
    }

    #[test]
    fn disallowed_operator_is_invalid_query() {
        for raw in [
            json!({"$lt": {"reference": "a"}}),
            json!({"$like": {"reverted": true}}),
            json!({"$exists": {"id": true}}),
        ] {
            let err = validate_filters(&schema(), Some(&expr(raw.clone()))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidQuery, "{raw}");
            assert!(err.to_string().contains("is not allowed"), "{raw}");
        }
    }

    #[test]
    fn badly_typed_value_is_invalid_query() {
        for raw in [
            json!({"$match": {"reverted": "yes"}}),
            json!({"$gt": {"timestamp": 12}}),
            json!({"$match": {"metadata[a]": false}}),
        ] {
            let err = validate_filters(&schema(), Some(&expr(raw.clone()))).unwrap_err();
            assert!(err.to_string().contains("invalid value"), "{raw}");
        }
    }

    #[test]
    fn valid_filters_are_recorded_by_canonical_name() {
        let filters = validate_filters(
            &schema(),
            Some(&QueryExpr::and(vec![
                QueryExpr::matches("reverted", true),
                QueryExpr::matches("metadata[role]", "admin"),
                QueryExpr::exists("metadata[vip]", true),
                QueryExpr::leaf(Operator::Gte, "id", 10),
            ])),
        )
        .unwrap();

        assert!(filters.is_used("reverted"));
        assert!(filters.use_filter("reverted", |v| v == &json!(true)));
        assert!(!filters.use_filter("reverted", |v| v == &json!(false)));
        assert_eq!(filters.values("metadata").len(), 2);
        assert!(!filters.is_used("timestamp"));
        assert!(filters.values("timestamp").is_empty());
    }

    #[test]
    fn missing_expression_validates_to_nothing() {
        assert_eq!(validate_filters(&schema(), None).unwrap(), ValidatedFilters::default());
    }
}
