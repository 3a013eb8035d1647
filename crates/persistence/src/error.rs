use std::time::Duration;

use thiserror::Error;

use crate::Table;

/// Unique constraint guarding `users.email`.
pub const USERS_EMAIL_KEY: &str = "users_email_key";

/// Unique constraint guarding `users.username`.
pub const USERS_USERNAME_KEY: &str = "users_username_key";

/// Unique constraint guarding `tags.name`.
pub const TAGS_NAME_KEY: &str = "tags_name_key";

/// Errors that can occur when talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced row does not exist (or is soft-deleted).
    #[error("{table} record not found: {id}")]
    NotFound { table: Table, id: i64 },

    /// A lookup by something other than the primary key matched no row.
    #[error("record not found")]
    RowNotFound,

    /// Another user already owns this email address.
    #[error("email already exists")]
    DuplicateEmail,

    /// Another user already owns this username.
    #[error("username already exists")]
    DuplicateUsername,

    /// A tag with this name exists under a different slug.
    #[error("tag name already exists")]
    DuplicateTagName,

    /// A counter update would leave the column outside `BIGINT`.
    #[error("{table}.{column} out of range")]
    OutOfRange {
        table: Table,
        column: &'static str,
    },

    /// A hard delete was refused because rows in `by` still point at the
    /// row through a foreign key without `ON DELETE CASCADE`.
    #[error("{table} record {id} is still referenced by {by}")]
    StillReferenced { table: Table, id: i64, by: Table },

    /// The operation did not finish before its deadline. The transaction
    /// it ran in has been rolled back.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(table: Table, id: impl Into<i64>) -> Self {
        StoreError::NotFound {
            table,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. } | StoreError::RowNotFound)
    }

    /// Returns true for connectivity and deadline failures, where retrying
    /// the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::RowNotFound = err {
            return StoreError::RowNotFound;
        }
        if let sqlx::Error::Database(ref db_err) = err {
            match db_err.constraint() {
                Some(USERS_EMAIL_KEY) => return StoreError::DuplicateEmail,
                Some(USERS_USERNAME_KEY) => return StoreError::DuplicateUsername,
                Some(TAGS_NAME_KEY) => return StoreError::DuplicateTagName,
                _ => {}
            }
        }
        StoreError::Database(err)
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
