//! Domain layer for the relational reference workspace.
//!
//! This crate provides:
//! - `UserService`, which wraps a `UserRepository` in lifecycle hooks
//! - the hooks themselves (UUID assignment, email validation, admin
//!   protection, email change logging)
//! - batch processing and bounded-time lookups over users

pub mod error;
pub mod hooks;
pub mod service;

pub use error::{DomainError, Result};
pub use service::UserService;
