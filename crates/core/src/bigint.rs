//! Serde helpers for arbitrary-precision integers.
//!
//! Values are written as decimal strings so they survive JSON consumers that
//! round numbers through 64-bit floats. Decoding accepts decimal strings and
//! JSON integers.

use num_bigint::BigInt;
use serde::Deserialize;
use serde_json::Value;

/// Parse an integer out of a JSON value (decimal string or integer number).
pub fn parse_bigint(value: &Value) -> Option<BigInt> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n
            .as_i64()
            .map(BigInt::from)
            .or_else(|| n.as_u64().map(BigInt::from)),
        _ => None,
    }
}

pub mod as_string {
    use super::*;
    use serde::{Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_bigint(&value).ok_or_else(|| de::Error::custom(format!("invalid integer: {value}")))
    }
}

pub mod option_as_string {
    use super::*;
    use serde::{Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &Option<BigInt>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BigInt>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse_bigint(&value)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid integer: {value}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "as_string")]
        amount: BigInt,
        #[serde(default, with = "option_as_string")]
        bookmark: Option<BigInt>,
    }

    #[test]
    fn large_values_are_written_as_strings() {
        let amount: BigInt = "340282366920938463463374607431768211456".parse().unwrap();
        let json = serde_json::to_value(Holder { amount: amount.clone(), bookmark: None }).unwrap();
        assert_eq!(json["amount"], Value::String(amount.to_string()));
        assert_eq!(json["bookmark"], Value::Null);
    }

    #[test]
    fn integers_and_strings_are_both_accepted() {
        let holder: Holder =
            serde_json::from_str(r#"{"amount": 42, "bookmark": "-7"}"#).unwrap();
        assert_eq!(holder.amount, BigInt::from(42));
        assert_eq!(holder.bookmark, Some(BigInt::from(-7)));

        let holder: Holder = serde_json::from_str(r#"{"amount": "1"}"#).unwrap();
        assert_eq!(holder.bookmark, None);
    }

    #[test]
    fn fractional_numbers_are_rejected() {
        assert!(serde_json::from_str::<Holder>(r#"{"amount": 1.5}"#).is_err());
        assert!(parse_bigint(&Value::Bool(true)).is_none());
    }
}
