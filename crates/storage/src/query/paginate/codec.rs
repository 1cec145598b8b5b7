//! Opaque cursor tokens.
//!
//! A token is the JSON form of a paginated query, base64 encoded with the
//! URL-safe alphabet and no padding. Offset and column queries share their
//! initial fields; only offset queries carry an `offset` key, which is how a
//! token is told apart before it is fully decoded.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{InitialPaginatedQuery, PaginatedQuery};
use crate::error::{StorageError, StorageResult};

/// A caller-supplied adjustment applied to a decoded query.
pub type QueryModifier<'a, O> = &'a dyn Fn(&mut InitialPaginatedQuery<O>);

pub fn encode_cursor<T: Serialize>(query: &T) -> StorageResult<String> {
    let json = serde_json::to_vec(query)
        .map_err(|e| StorageError::invalid_cursor(format!("encoding cursor: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_cursor<O>(token: &str, modifiers: &[QueryModifier<'_, O>]) -> StorageResult<PaginatedQuery<O>>
where
    O: DeserializeOwned + Default,
{
    let raw = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| StorageError::invalid_cursor(format!("decoding base64: {e}")))?;
    let value: Value = serde_json::from_slice(&raw)
        .map_err(|e| StorageError::invalid_cursor(format!("decoding json: {e}")))?;

    let is_offset = value
        .as_object()
        .ok_or_else(|| StorageError::invalid_cursor("cursor is not a json object"))?
        .contains_key("offset");

    let mut query = if is_offset {
        PaginatedQuery::Offset(
            serde_json::from_value(value)
                .map_err(|e| StorageError::invalid_cursor(format!("decoding offset query: {e}")))?,
        )
    } else {
        PaginatedQuery::Column(
            serde_json::from_value(value)
                .map_err(|e| StorageError::invalid_cursor(format!("decoding column query: {e}")))?,
        )
    };

    for modifier in modifiers {
        modifier(query.initial_mut());
    }
    Ok(query)
}

/// Modifier applying page-size bounds: zero becomes `default`, anything
/// above `max` is clamped.
pub fn with_page_size_bounds<O>(default: u64, max: u64) -> impl Fn(&mut InitialPaginatedQuery<O>) {
    move |query| {
        query.page_size = match query.page_size {
            0 => default,
            n => n.min(max),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::query::expr::{Operator, QueryExpr};
    use crate::query::paginate::{ColumnPaginatedQuery, OffsetPaginatedQuery, Order};
    use crate::query::resource::ResourceQuery;
    use chrono::{TimeZone, Utc};
    use num_bigint::BigInt;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct VolumeOptions {
        #[serde(default)]
        use_insertion_date: bool,
        #[serde(default)]
        group_level: usize,
    }

    fn initial() -> InitialPaginatedQuery<VolumeOptions> {
        let mut options = ResourceQuery::new(VolumeOptions {
            use_insertion_date: true,
            group_level: 2,
        });
        options.pit = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        options.builder = Some(QueryExpr::and(vec![
            QueryExpr::matches("metadata[role]", "admin"),
            QueryExpr::leaf(Operator::Gte, "balance[USD]", 100),
        ]));
        options.expand = vec!["volumes".to_string()];

        InitialPaginatedQuery::new(options)
            .with_column("address")
            .with_order(Order::Desc)
            .with_page_size(25)
    }

    #[test]
    fn offset_query_round_trips() {
        let query = OffsetPaginatedQuery {
            initial: initial(),
            offset: 50,
        };
        let token = encode_cursor(&query).unwrap();
        assert!(!token.contains('='));
        assert_eq!(
            decode_cursor::<VolumeOptions>(&token, &[]).unwrap(),
            PaginatedQuery::Offset(query)
        );
    }

    #[test]
    fn column_query_round_trips() {
        let query = ColumnPaginatedQuery {
            initial: initial().with_column("first_usage"),
            pagination_id: Some("1709294400000000".parse::<BigInt>().unwrap()),
            bottom: Some(BigInt::from(-3)),
            reverse: true,
        };
        let token = encode_cursor(&query).unwrap();
        assert_eq!(
            decode_cursor::<VolumeOptions>(&token, &[]).unwrap(),
            PaginatedQuery::Column(query)
        );
    }

    #[test]
    fn initial_query_decodes_as_unbookmarked_column_query() {
        let token = encode_cursor(&initial()).unwrap();
        assert_eq!(
            decode_cursor::<VolumeOptions>(&token, &[]).unwrap(),
            PaginatedQuery::Column(ColumnPaginatedQuery::new(initial()))
        );
    }

    #[test]
    fn wire_keys() {
        let query = OffsetPaginatedQuery {
            initial: initial(),
            offset: 5,
        };
        let json = serde_json::to_value(&query).unwrap();
        for key in ["column", "order", "pageSize", "filters", "offset"] {
            assert!(json.get(key).is_some(), "{key}");
        }
        assert_eq!(json["order"], "desc");
        assert!(json["filters"].get("qb").is_some());
        assert!(json["filters"].get("opts").is_some());
    }

    #[test]
    fn modifiers_apply_to_the_initial_query() {
        let token = encode_cursor(&initial().with_page_size(500)).unwrap();
        let bounds: QueryModifier<'_, VolumeOptions> = &with_page_size_bounds(15, 100);
        let query = decode_cursor(&token, &[bounds]).unwrap();
        assert_eq!(query.initial().page_size, 100);

        let token = encode_cursor(&initial().with_page_size(0)).unwrap();
        let query = decode_cursor(&token, &[bounds]).unwrap();
        assert_eq!(query.initial().page_size, 15);
    }

    #[test]
    fn malformed_tokens_are_invalid_cursors() {
        let not_json = URL_SAFE_NO_PAD.encode(b"not json");
        let not_object = URL_SAFE_NO_PAD.encode(b"[1,2]");
        let bad_offset = URL_SAFE_NO_PAD.encode(br#"{"offset": "x"}"#);
        for token in ["%%%", not_json.as_str(), not_object.as_str(), bad_offset.as_str()] {
            let err = decode_cursor::<VolumeOptions>(token, &[]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidCursor, "{token}");
        }
    }
}
