//! Domain error types.

use std::time::Duration;

use common::UserId;
use persistence::StoreError;
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The email address is not of the form `local@domain.tld`.
    #[error("invalid email format: {0}")]
    InvalidEmail(String),

    #[error("username is required")]
    MissingUsername,

    /// Admin accounts cannot be deleted.
    #[error("cannot delete admin user {0}")]
    AdminDeletion(UserId),

    /// The query did not finish before its deadline.
    #[error("query timed out after {0:?}")]
    TimedOut(Duration),
}

impl DomainError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::Store(err) if err.is_not_found())
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
