//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur when building domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was empty (or whitespace only)
    #[error("{kind} must not be empty")]
    EmptyIdentifier { kind: &'static str },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
