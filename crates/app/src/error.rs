use domain::DomainError;
use persistence::StoreError;
use thiserror::Error;
use workflows::WorkflowError;

/// Errors that abort the process.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("user service error: {0}")]
    Domain(#[from] DomainError),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("failed to install tracing subscriber: {0}")]
    Telemetry(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Store(err.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
