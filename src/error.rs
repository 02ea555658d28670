//! Typed error families, one per subsystem boundary (§7).

use thiserror::Error;

/// Errors crossing the Exchange Adapter boundary (C3/C4).
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("adapter call exceeded its deadline")]
    Timeout,

    #[error("transient adapter error: {0}")]
    Transient(String),

    #[error("adapter authentication failed: {0}")]
    AuthFailed(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("cancel failed: {0}")]
    CancelFailed(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
}

impl AdapterError {
    /// Recoverable-internal errors are retried inside C4 before the
    /// strategy ever observes them (§7).
    pub fn is_recoverable_internal(&self) -> bool {
        matches!(self, AdapterError::Timeout | AdapterError::Transient(_))
    }
}

/// Errors crossing the Config Store / Registry boundary (C1/C5).
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("duplicate strategy name: {0}")]
    DuplicateName(String),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("config store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Top-level error surfaced at the HTTP boundary (C8). Maps each variant
/// to the HTTP status `spec.md` §7 assigns it.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ApiError::Config(ConfigError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
            ApiError::Config(ConfigError::DuplicateName(_)) => StatusCode::CONFLICT,
            ApiError::Config(ConfigError::UnknownStrategy(_)) => StatusCode::NOT_FOUND,
            ApiError::Config(ConfigError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Adapter(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
