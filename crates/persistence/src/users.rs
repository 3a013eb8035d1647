//! User repository: CRUD, soft deletes and batch reads over `users`.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::UserId;
use futures_core::Stream;
use futures_util::{TryStreamExt, stream};

use crate::{Result, StoreError};
use crate::model::{NewUser, User};

/// Users inserted per statement by [`UserRepository::create_batch`].
pub const CREATE_BATCH_SIZE: usize = 100;

/// Page size used when streaming users.
const STREAM_PAGE_SIZE: u32 = 200;

/// A stream of users.
pub type UserStream = Pin<Box<dyn Stream<Item = Result<User>> + Send>>;

/// One page of a listing. Pages are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * i64::from(self.per_page)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.per_page)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

/// Optional conditions for [`UserRepository::find_with_filters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilters {
    pub is_active: Option<bool>,
    /// Case-insensitive substring of the username.
    pub username: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
}

impl UserFilters {
    pub fn matches(&self, user: &User) -> bool {
        if let Some(active) = self.is_active
            && user.is_active != active
        {
            return false;
        }
        if let Some(ref fragment) = self.username
            && !user
                .username
                .to_lowercase()
                .contains(&fragment.to_lowercase())
        {
            return false;
        }
        if let Some(after) = self.created_after
            && user.created_at <= after
        {
            return false;
        }
        true
    }
}

/// `LIKE` pattern matching `fragment` anywhere, with `\`, `%` and `_`
/// escaped so they match literally. Pair with `ESCAPE '\'`.
pub(crate) fn contains_pattern(fragment: &str) -> String {
    let mut pattern = String::with_capacity(fragment.len() + 2);
    pattern.push('%');
    for c in fragment.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// A partial update; only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub is_active: Option<bool>,
    pub preferences: Option<serde_json::Value>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, user: &mut User) {
        if let Some(ref v) = self.first_name {
            user.first_name = Some(v.clone());
        }
        if let Some(ref v) = self.last_name {
            user.last_name = Some(v.clone());
        }
        if let Some(ref v) = self.email {
            user.email = v.clone();
        }
        if let Some(ref v) = self.username {
            user.username = v.clone();
        }
        if let Some(v) = self.is_active {
            user.is_active = v;
        }
        if let Some(ref v) = self.preferences {
            user.preferences = v.clone();
        }
    }
}

/// Persistence for users.
///
/// Soft-deleted users are invisible to every read; only
/// [`UserRepository::restore`] and [`UserRepository::hard_delete`] reach
/// them.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Inserts a user and its `user_created` audit entry in one transaction.
    async fn create(&self, user: NewUser) -> Result<User>;

    /// Inserts many users in one transaction, [`CREATE_BATCH_SIZE`] per
    /// statement.
    async fn create_batch(&self, users: Vec<NewUser>) -> Result<Vec<User>>;

    /// Inserts a user, or updates `username` of the user holding the same
    /// email.
    async fn upsert(&self, user: NewUser) -> Result<User>;

    async fn find_by_id(&self, id: UserId) -> Result<User>;

    async fn find_by_email(&self, email: &str) -> Result<User>;

    /// Newest first, with the total number of live users.
    async fn find_all(&self, page: Page) -> Result<(Vec<User>, i64)>;

    async fn find_with_filters(&self, filters: UserFilters) -> Result<Vec<User>>;

    /// Fails with `NotFound` when no live row has this id.
    async fn update(&self, id: UserId, update: UserUpdate) -> Result<User>;

    /// Writes every mutable column of `user`.
    async fn save(&self, user: &User) -> Result<()>;

    async fn update_last_login(&self, id: UserId) -> Result<()>;

    /// Atomically adds one to `login_count`.
    async fn increase_login_count(&self, id: UserId) -> Result<()>;

    /// Soft delete.
    async fn delete(&self, id: UserId) -> Result<()>;

    async fn hard_delete(&self, id: UserId) -> Result<()>;

    /// Soft-deletes inactive users whose last login is before `before`.
    /// Returns the number of users deleted.
    async fn delete_inactive_before(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Clears `deleted_at`.
    async fn restore(&self, id: UserId) -> Result<()>;

    /// Emails of all live users, in id order.
    async fn all_emails(&self) -> Result<Vec<String>>;

    /// Up to `limit` active users with id greater than `after`, in id order.
    async fn fetch_active_batch(&self, after: Option<UserId>, limit: u32) -> Result<Vec<User>>;
}

/// Extension trait providing convenience methods for user repositories.
pub trait UserRepositoryExt: UserRepository + Clone + 'static {
    /// Streams every active user in id order, one page at a time, without
    /// holding a connection between pages.
    fn stream_active(&self) -> UserStream {
        let pages = stream::try_unfold(
            (self.clone(), None::<UserId>, false),
            |(repo, after, exhausted)| async move {
                if exhausted {
                    return Ok::<_, StoreError>(None);
                }
                let page = repo.fetch_active_batch(after, STREAM_PAGE_SIZE).await?;
                let exhausted = page.len() < STREAM_PAGE_SIZE as usize;
                let next = page.last().map(|u| u.id).or(after);
                Ok(Some((page, (repo, next, exhausted))))
            },
        );
        Box::pin(
            pages
                .map_ok(|page| stream::iter(page.into_iter().map(Ok::<User, StoreError>)))
                .try_flatten(),
        )
    }
}

impl<T: UserRepository + Clone + 'static> UserRepositoryExt for T {}
