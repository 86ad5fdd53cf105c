use axum::http::StatusCode;
use thiserror::Error;

use crate::capabilities::Capability;

/// Every error kind the engine surfaces to callers — host APIs translate
/// their outcomes into one of these and throw them into JS; the request
/// pipeline maps them onto HTTP statuses.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Timeout: invocation exceeded the execution budget")]
    Timeout,

    #[error("ScriptError: {0}")]
    Script(String),

    #[error("CapabilityDenied: {0}")]
    CapabilityDenied(Capability),

    #[error("NotFound: {entity} '{id}'")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("InvalidInput: {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("TransactionTimeout: transaction exceeded its timeout and was rolled back")]
    TransactionTimeout,

    #[error("SecretNotFound: {0}")]
    SecretNotFound(String),

    #[error("NetworkBlocked: {0}")]
    NetworkBlocked(String),

    #[error("StreamNotRegistered: {0}")]
    StreamNotRegistered(String),

    #[error("ScheduleBadTime: {0}")]
    ScheduleBadTime(String),

    #[error("Internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::Internal(detail.to_string())
    }

    /// HTTP status for this error when it escapes a handler invocation.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::CapabilityDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InvalidInput { .. } | Self::ScheduleBadTime(_) => StatusCode::BAD_REQUEST,
            Self::NetworkBlocked(_) => StatusCode::BAD_GATEWAY,
            Self::Script(_)
            | Self::TransactionTimeout
            | Self::SecretNotFound(_)
            | Self::StreamNotRegistered(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
