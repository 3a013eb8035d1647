//! User service: repository calls wrapped in lifecycle hooks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::UserId;
use futures_util::TryStreamExt;
use persistence::{NewUser, Page, User, UserFilters, UserRepository, UserRepositoryExt, UserUpdate};

use crate::error::{DomainError, Result};
use crate::hooks;

/// Service for managing users.
///
/// Runs the before-create, before-update and before-delete hooks around the
/// repository; the after-create audit entry is written by the repository in
/// the same transaction as the insert.
pub struct UserService<R: UserRepository> {
    repo: R,
}

impl<R: UserRepository> UserService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Returns a reference to the underlying repository.
    pub fn repository(&self) -> &R {
        &self.repo
    }

    #[tracing::instrument(skip(self, user), fields(username = %user.username))]
    pub async fn create(&self, mut user: NewUser) -> Result<User> {
        hooks::before_create(&mut user)?;
        let created = self.repo.create(user).await?;
        metrics::counter!("users_created_total").increment(1);
        tracing::info!(user_id = %created.id, "user created");
        Ok(created)
    }

    /// Creates every user in one transaction. Hooks run for all users
    /// before anything is written.
    #[tracing::instrument(skip(self, users), fields(count = users.len()))]
    pub async fn create_batch(&self, mut users: Vec<NewUser>) -> Result<Vec<User>> {
        for user in &mut users {
            hooks::before_create(user)?;
        }
        let created = self.repo.create_batch(users).await?;
        metrics::counter!("users_created_total").increment(created.len() as u64);
        Ok(created)
    }

    pub async fn upsert(&self, mut user: NewUser) -> Result<User> {
        hooks::before_create(&mut user)?;
        Ok(self.repo.upsert(user).await?)
    }

    pub async fn find(&self, id: UserId) -> Result<User> {
        Ok(self.repo.find_by_id(id).await?)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<User> {
        Ok(self.repo.find_by_email(email).await?)
    }

    /// Like [`UserService::find`], bounded by `timeout`.
    #[tracing::instrument(skip(self))]
    pub async fn find_with_timeout(&self, id: UserId, timeout: Duration) -> Result<User> {
        match tokio::time::timeout(timeout, self.repo.find_by_id(id)).await {
            Ok(found) => Ok(found?),
            Err(_) => {
                tracing::warn!(user_id = %id, ?timeout, "user lookup timed out");
                Err(DomainError::TimedOut(timeout))
            }
        }
    }

    pub async fn list(&self, page: Page) -> Result<(Vec<User>, i64)> {
        Ok(self.repo.find_all(page).await?)
    }

    pub async fn search(&self, filters: UserFilters) -> Result<Vec<User>> {
        Ok(self.repo.find_with_filters(filters).await?)
    }

    #[tracing::instrument(skip(self, update))]
    pub async fn update(&self, id: UserId, update: UserUpdate) -> Result<User> {
        let current = self.repo.find_by_id(id).await?;
        hooks::before_update(&current, &update)?;
        if update.is_empty() {
            return Ok(current);
        }
        Ok(self.repo.update(id, update).await?)
    }

    /// Soft-deletes a user. Admins are refused.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: UserId) -> Result<()> {
        let user = self.repo.find_by_id(id).await?;
        hooks::before_delete(&user)?;
        self.repo.delete(id).await?;
        tracing::info!(user_id = %id, "user deleted");
        Ok(())
    }

    pub async fn restore(&self, id: UserId) -> Result<()> {
        Ok(self.repo.restore(id).await?)
    }

    /// Stamps the last login time and bumps the login counter.
    #[tracing::instrument(skip(self))]
    pub async fn record_login(&self, id: UserId) -> Result<()> {
        self.repo.update_last_login(id).await?;
        self.repo.increase_login_count(id).await?;
        Ok(())
    }

    /// Soft-deletes inactive users who last logged in before `before`.
    #[tracing::instrument(skip(self))]
    pub async fn purge_inactive(&self, before: DateTime<Utc>) -> Result<u64> {
        let purged = self.repo.delete_inactive_before(before).await?;
        tracing::info!(purged, "inactive users purged");
        Ok(purged)
    }

    pub async fn all_emails(&self) -> Result<Vec<String>> {
        Ok(self.repo.all_emails().await?)
    }

    /// Hands active users to `f` in id-ordered batches of at most
    /// `batch_size`. Stops at the first error. Returns the number of users
    /// processed.
    #[tracing::instrument(skip(self, f))]
    pub async fn process_active_in_batches<F>(&self, batch_size: u32, mut f: F) -> Result<u64>
    where
        F: FnMut(&[User]) -> Result<()> + Send,
    {
        let batch_size = batch_size.max(1);
        let mut after = None;
        let mut processed = 0;

        loop {
            let batch = self.repo.fetch_active_batch(after, batch_size).await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id);

            f(&batch)?;
            processed += batch.len() as u64;
            tracing::debug!(processed, "processed user batch");

            if batch.len() < batch_size as usize {
                break;
            }
        }

        Ok(processed)
    }
}

impl<R: UserRepositoryExt> UserService<R> {
    /// Calls `f` for every active user, streaming rows page by page.
    pub async fn for_each_active<F>(&self, mut f: F) -> Result<u64>
    where
        F: FnMut(User) -> Result<()> + Send,
    {
        let mut users = self.repo.stream_active();
        let mut seen = 0;
        while let Some(user) = users.try_next().await? {
            f(user)?;
            seen += 1;
        }
        Ok(seen)
    }
}
