use fieldsync_core::CoreError;
use fieldsync_storage::CacheError;
use thiserror::Error;

/// Whether a failed remote call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
}

/// Failure reported by the remote data gateway. The variant is the retry
/// classification and must survive all the way to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Network trouble, timeouts, 5xx-class responses.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The acting user does not own the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("remote record not found: {0}")]
    NotFound(String),

    /// The remote schema rejected the payload.
    #[error("validation error: {0}")]
    Validation(String),
}

impl GatewayError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transient(_) => RetryClass::Retryable,
            Self::Forbidden(_) | Self::NotFound(_) | Self::Validation(_) => RetryClass::Permanent,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("ownership denied: {0}")]
    OwnershipDenied(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("offline: {0}")]
    Offline(String),
}
