//! Error kinds shared by every Dripcast crate.

use thiserror::Error;

/// Dripcast error type.
#[derive(Debug, Error)]
pub enum DripError {
    /// The store could not hand out a connection (or the database stayed locked)
    /// within the retry budget.
    #[error("Store busy: {0}")]
    StoreBusy(String),

    #[error("Store integrity error: {0}")]
    StoreIntegrity(String),

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Recipient blocked the bot or the account is gone.
    #[error("Recipient gone: {0}")]
    TransportPermanent(String),

    #[error("Rate limited (retry after {retry_after:?}s)")]
    TransportRateLimited { retry_after: Option<u64> },

    #[error("Transient transport error: {0}")]
    TransportTransient(String),

    /// The message itself was rejected (bad markup, dead photo reference).
    #[error("Bad template: {0}")]
    TransportBadTemplate(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DripError {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable snake_case kind, used as a structured log field and in API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreBusy(_) => "store_busy",
            Self::StoreIntegrity(_) => "store_integrity",
            Self::Validation { .. } => "validation",
            Self::NotFound(_) => "not_found",
            Self::TransportPermanent(_) => "permanent_recipient_gone",
            Self::TransportRateLimited { .. } => "rate_limited",
            Self::TransportTransient(_) => "transient_network",
            Self::TransportBadTemplate(_) => "bad_template",
            Self::Config(_) => "config",
            Self::Channel(_) => "channel",
            Self::Gateway(_) => "gateway",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// True for the transport kinds the dispatcher should retry on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreBusy(_) | Self::TransportRateLimited { .. } | Self::TransportTransient(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DripError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(DripError::StoreBusy("x".into()).kind(), "store_busy");
        assert_eq!(
            DripError::TransportRateLimited { retry_after: Some(3) }.kind(),
            "rate_limited"
        );
        assert_eq!(DripError::validation("seq_no", "missing").kind(), "validation");
    }

    #[test]
    fn test_validation_message_names_field() {
        let e = DripError::validation("delay_hours", "must be >= 0");
        assert_eq!(e.to_string(), "Invalid delay_hours: must be >= 0");
    }

    #[test]
    fn test_retryable() {
        assert!(DripError::TransportTransient("reset".into()).is_retryable());
        assert!(!DripError::TransportPermanent("blocked".into()).is_retryable());
        assert!(!DripError::TransportBadTemplate("markup".into()).is_retryable());
    }
}
