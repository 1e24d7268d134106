//! Domain-specific error types following panic-free policy.

use crate::ClientName;
use thiserror::Error;

/// Errors that can occur in domain operations.
///
/// The three readiness variants are checked in order (deregistered, offline,
/// sleeping) before any request leaves the server.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// The device is no longer registered
    #[error("{client_name} was deregistered.")]
    Deregistered { client_name: ClientName },

    /// The device did not answer its last exchange
    #[error("{client_name} is offline.")]
    Offline { client_name: ClientName },

    /// The device checked out and is sleeping
    #[error("{client_name} is sleeping.")]
    Sleeping { client_name: ClientName },

    /// A resource path was malformed or too shallow for the operation
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A value cannot be sent to the given path
    #[error("Invalid value for {path}: {reason}")]
    InvalidValue { path: String, reason: String },

    /// A notification attribute outside pmin/pmax/gt/lt/stp/step
    #[error("{0} is not allowed.")]
    AttributeNotAllowed(String),

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Shorthand for an [`DomainError::InvalidPath`].
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`DomainError::InvalidValue`].
    pub fn invalid_value(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for the readiness failures (deregistered, offline, sleeping).
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Deregistered { .. } | Self::Offline { .. } | Self::Sleeping { .. }
        )
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
