use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Failures raised by the pure ledger types.
///
/// Anything that needs the database to decide (missing rows, duplicate
/// references) is reported by the storage and controller layers instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input that can never be accepted: bad address, negative amount,
    /// empty postings, unknown ledger state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A log `(type, data)` pair, or another serialized ledger value, that
    /// does not decode into the shape its type announces.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_failures_become_malformed_payloads() {
        let err: DomainError = serde_json::from_str::<u64>("\"seven\"").unwrap_err().into();
        assert!(matches!(err, DomainError::MalformedPayload(_)));
        assert!(err.to_string().starts_with("malformed payload: "));
    }
}
