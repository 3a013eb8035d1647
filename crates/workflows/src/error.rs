//! Workflow error types.

use common::{ProductId, UserId};
use persistence::{StoreError, Table};
use thiserror::Error;

use crate::order::RejectedItem;

/// Broad classification of a failure, for callers deciding whether to
/// retry, report or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Integrity,
    Transient,
    Invalid,
}

/// Errors returned by the order and credit transfer workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A referenced row does not exist or is soft-deleted.
    #[error("{entity} not found: {id}")]
    NotFound { entity: Table, id: i64 },

    /// The source account cannot cover the transfer.
    #[error("insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits { available: i64, requested: i64 },

    /// Every item of the order failed; the order header was rolled back.
    #[error("no items were added to the order ({} rejected)", .rejected.len())]
    NoItemsAdded { rejected: Vec<RejectedItem> },

    /// Transfer amounts must be positive.
    #[error("invalid transfer amount: {0}")]
    InvalidAmount(i64),

    #[error("cannot transfer credits from account {0} to itself")]
    SameAccount(UserId),

    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::NotFound { .. } => ErrorKind::NotFound,
            WorkflowError::InsufficientCredits { .. } => ErrorKind::Conflict,
            WorkflowError::NoItemsAdded { .. } => ErrorKind::Integrity,
            WorkflowError::InvalidAmount(_) | WorkflowError::SameAccount(_) => ErrorKind::Invalid,
            WorkflowError::Store(err) => store_kind(err),
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { table, id } => WorkflowError::NotFound { entity: table, id },
            other => WorkflowError::Store(other),
        }
    }
}

fn store_kind(err: &StoreError) -> ErrorKind {
    if err.is_transient() {
        return ErrorKind::Transient;
    }
    match err {
        StoreError::NotFound { .. } | StoreError::RowNotFound => ErrorKind::NotFound,
        StoreError::DuplicateEmail
        | StoreError::DuplicateUsername
        | StoreError::DuplicateTagName
        | StoreError::StillReferenced { .. } => ErrorKind::Conflict,
        _ => ErrorKind::Integrity,
    }
}

/// Why a single order item was not added. Recorded in the receipt; never
/// fails the order on its own.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("quantity must be at least 1")]
    InvalidQuantity,

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ItemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ItemError::InvalidQuantity => ErrorKind::Invalid,
            ItemError::ProductNotFound(_) => ErrorKind::NotFound,
            ItemError::InsufficientStock { .. } => ErrorKind::Conflict,
            ItemError::Store(err) => store_kind(err),
        }
    }
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
