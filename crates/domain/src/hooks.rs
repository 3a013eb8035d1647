//! Lifecycle hooks run by [`crate::UserService`] around repository calls.

use std::sync::LazyLock;

use persistence::{EMAIL_PATTERN, NewUser, User, UserUpdate};
use regex::Regex;
use uuid::Uuid;

use crate::error::{DomainError, Result};

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(EMAIL_PATTERN).expect("email pattern compiles"));

/// Whether `email` passes the `chk_email_format` constraint on `users`.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// Assigns a UUID when none is set and validates the new user.
pub fn before_create(user: &mut NewUser) -> Result<()> {
    if user.uuid.is_nil() {
        user.uuid = Uuid::new_v4();
    }
    if !is_valid_email(&user.email) {
        return Err(DomainError::InvalidEmail(user.email.clone()));
    }
    if user.username.trim().is_empty() {
        return Err(DomainError::MissingUsername);
    }
    Ok(())
}

/// Validates an update against the stored user and logs email changes.
pub fn before_update(current: &User, update: &UserUpdate) -> Result<()> {
    if let Some(ref email) = update.email {
        if !is_valid_email(email) {
            return Err(DomainError::InvalidEmail(email.clone()));
        }
        if *email != current.email {
            tracing::info!(
                user_id = %current.id,
                old_email = %current.email,
                new_email = %email,
                "user changing email"
            );
        }
    }
    if let Some(ref username) = update.username
        && username.trim().is_empty()
    {
        return Err(DomainError::MissingUsername);
    }
    Ok(())
}

/// Refuses to delete admins.
pub fn before_delete(user: &User) -> Result<()> {
    if user.is_admin() {
        return Err(DomainError::AdminDeletion(user.id));
    }
    Ok(())
}
