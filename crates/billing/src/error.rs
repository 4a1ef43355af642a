//! Billing error types

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(Uuid),

    #[error("Invalid {field}: {reason}")]
    InvalidSetting {
        field: &'static str,
        reason: String,
    },

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Validation failures the caller can fix by changing the request
    pub fn is_validation(&self) -> bool {
        matches!(self, BillingError::InvalidSetting { .. })
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        BillingError::InvalidSetting {
            field,
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<intervo_shared::ParseEnumError> for BillingError {
    fn from(e: intervo_shared::ParseEnumError) -> Self {
        BillingError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_setting_display() {
        let err = BillingError::invalid("currency", "must be a 3-letter code");
        assert_eq!(err.to_string(), "Invalid currency: must be a 3-letter code");
        assert!(err.is_validation());
    }

    #[test]
    fn test_lookup_errors_are_not_validation() {
        let err = BillingError::WorkspaceNotFound(Uuid::nil());
        assert!(!err.is_validation());
        assert!(err.to_string().starts_with("Workspace not found"));
    }
}
