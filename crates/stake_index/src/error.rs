use std::time::Duration;

use thiserror::Error;

use crate::types::DelegationState;

/// Failures reported by a [`crate::store::DocumentStore`] backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("duplicate key value violates unique constraint on '{key}'")]
    DuplicateKey { key: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A document was refused before reaching the backend.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("document codec failure: {0}")]
    Codec(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    /// A single store call exceeded the service's store timeout.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

/// Errors returned by the query, transition and aggregation layers.
#[derive(Debug, Error)]
pub enum StakeError {
    #[error("{message}: {key}")]
    NotFound { key: String, message: &'static str },
    #[error("delegation {key} not found or not in eligible state to transition to {target}")]
    NotEligible {
        key: String,
        target: DelegationState,
    },
    #[error("transition from {from} to {to} is not permitted")]
    IllegalTransition {
        from: DelegationState,
        to: DelegationState,
    },
    #[error("invalid pagination token: {0}")]
    InvalidToken(String),
    #[error("no finality providers found from global params")]
    NoReferenceData,
    #[error("{op} cancelled")]
    Cancelled { op: &'static str },
    /// The caller's deadline expired.
    #[error("{op} deadline exceeded after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Caller-facing outcome class for a [`StakeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    NotFound,
    Internal,
}

impl ErrorClass {
    pub fn status_code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL_SERVICE_ERROR",
        }
    }
}

impl StakeError {
    /// Classifies the error once at the boundary.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidToken(_)
            | Self::IllegalTransition { .. }
            | Self::Store(StoreError::InvalidDocument(_)) => ErrorClass::BadRequest,
            Self::NotFound { .. } | Self::NotEligible { .. } => ErrorClass::NotFound,
            Self::NoReferenceData
            | Self::Cancelled { .. }
            | Self::Timeout { .. }
            | Self::Store(_) => ErrorClass::Internal,
        }
    }

    pub fn is_invalid_token(&self) -> bool {
        matches!(self, Self::InvalidToken(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NotEligible { .. })
    }

    /// `true` when the caller's context stopped the request. A store call
    /// hitting the store timeout is a [`StoreError`], not an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Timeout { .. })
    }
}
