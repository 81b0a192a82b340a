//! Error types for Shiptrack

use thiserror::Error;

/// Result type alias for Shiptrack operations
pub type Result<T> = std::result::Result<T, TrackError>;

/// Main error type for a tracking run.
///
/// Every variant is scoped to a single task: a batch, or one tracking
/// identifier inside a batch. None of them abort the worker pool.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Missing or unparseable field '{field}' for shipment '{tracking_id}'")]
    ParseField { tracking_id: String, field: String },

    #[error("Persistence error for '{key}': {reason}")]
    Persistence { key: String, reason: String },

    #[error("Batch '{0}' produced no usable shipment records")]
    NoUsableRecords(String),

    #[error("Task abandoned: {0}")]
    Abandoned(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrackError {
    /// Create a persistence error for a store key
    pub fn persistence(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Persistence {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a missing-field error for one shipment record
    pub fn parse_field(tracking_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ParseField {
            tracking_id: tracking_id.into(),
            field: field.into(),
        }
    }

    /// Short machine-readable kind, used in run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            TrackError::InvalidBatch(_) => "invalid_batch",
            TrackError::Fetch(_) => "fetch",
            TrackError::ParseField { .. } => "parse_field",
            TrackError::Persistence { .. } => "persistence",
            TrackError::NoUsableRecords(_) => "no_usable_records",
            TrackError::Abandoned(_) => "abandoned",
            TrackError::Config(_) => "config",
            TrackError::Io(_) => "io",
            TrackError::Serialization(_) => "serialization",
        }
    }
}

/// Failure of a single request to the partner endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("remote returned HTTP {status}")]
    RemoteError { status: u16 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Whether another attempt may succeed.
    ///
    /// Timeouts, connection failures and 5xx responses are transient.
    /// 4xx responses and undecodable bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connection(_) => true,
            FetchError::RemoteError { status } => *status >= 500,
            FetchError::MalformedResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Connection("reset by peer".into()).is_transient());
        assert!(FetchError::RemoteError { status: 503 }.is_transient());
        assert!(!FetchError::RemoteError { status: 404 }.is_transient());
        assert!(!FetchError::RemoteError { status: 429 }.is_transient());
        assert!(!FetchError::MalformedResponse("eof".into()).is_transient());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = TrackError::parse_field("1Z999", "Parcel_Status");
        assert_eq!(
            err.to_string(),
            "Missing or unparseable field 'Parcel_Status' for shipment '1Z999'"
        );

        let err: TrackError = FetchError::RemoteError { status: 502 }.into();
        assert_eq!(err.to_string(), "Fetch failed: remote returned HTTP 502");
        assert_eq!(err.kind(), "fetch");

        let err = TrackError::Abandoned("worker stopped".into());
        assert_eq!(err.kind(), "abandoned");
    }
}
