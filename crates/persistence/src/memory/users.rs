use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{PostId, UserId};
use tokio::sync::Mutex;

use super::MemoryTables;
use crate::model::{NewAuditLog, NewUser, User};
use crate::users::{Page, UserFilters, UserRepository, UserUpdate};
use crate::{Result, StoreError, Table};

/// In-memory user repository for testing.
///
/// Shares its tables with the [`super::InMemoryStore`] it came from.
/// Uniqueness of email and username is checked against every row,
/// soft-deleted ones included, as the database constraints do.
#[derive(Clone)]
pub struct InMemoryUserRepository {
    tables: Arc<Mutex<MemoryTables>>,
}

impl InMemoryUserRepository {
    pub fn new(tables: Arc<Mutex<MemoryTables>>) -> Self {
        Self { tables }
    }
}

/// Fails when a user other than `except` already holds `email` or
/// `username`.
fn check_unique(
    tables: &MemoryTables,
    email: &str,
    username: &str,
    except: Option<UserId>,
) -> Result<()> {
    for user in tables.users.values() {
        if Some(user.id) == except {
            continue;
        }
        if user.email == email {
            return Err(StoreError::DuplicateEmail);
        }
        if user.username == username {
            return Err(StoreError::DuplicateUsername);
        }
    }
    Ok(())
}

fn live_mut(tables: &mut MemoryTables, id: UserId) -> Result<&mut User> {
    tables
        .users
        .get_mut(&id.as_i64())
        .filter(|u| u.deleted_at.is_none())
        .ok_or_else(|| StoreError::not_found(Table::Users, id))
}

/// Applies the `ON DELETE` actions of the foreign keys pointing at a user:
/// their posts and comments go, comments on those posts go with them, and
/// tag links they added lose their `added_by`.
fn remove_authored(tables: &mut MemoryTables, id: UserId) {
    let posts: HashSet<PostId> = tables
        .posts
        .values()
        .filter(|p| p.user_id == id)
        .map(|p| p.id)
        .collect();

    tables.posts.retain(|_, p| !posts.contains(&p.id));
    for reply in tables.posts.values_mut() {
        if reply.parent_id.is_some_and(|parent| posts.contains(&parent)) {
            reply.parent_id = None;
        }
    }
    tables
        .comments
        .retain(|_, c| c.user_id != id && !posts.contains(&c.post_id));
    tables.post_tags.retain(|_, link| !posts.contains(&link.post_id));
    for link in tables.post_tags.values_mut() {
        if link.added_by == Some(id) {
            link.added_by = None;
        }
    }
}

fn live(tables: &MemoryTables) -> impl Iterator<Item = &User> {
    tables.users.values().filter(|u| u.deleted_at.is_none())
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: NewUser) -> Result<User> {
        let mut tables = self.tables.lock().await;
        check_unique(&tables, &user.email, &user.username, None)?;

        let created = tables.insert(user);
        tables.insert(NewAuditLog::user_created(created.id));
        Ok(created)
    }

    async fn create_batch(&self, users: Vec<NewUser>) -> Result<Vec<User>> {
        let mut tables = self.tables.lock().await;

        let mut emails = HashSet::new();
        let mut usernames = HashSet::new();
        for user in &users {
            check_unique(&tables, &user.email, &user.username, None)?;
            if !emails.insert(user.email.as_str()) {
                return Err(StoreError::DuplicateEmail);
            }
            if !usernames.insert(user.username.as_str()) {
                return Err(StoreError::DuplicateUsername);
            }
        }

        Ok(users.into_iter().map(|u| tables.insert(u)).collect())
    }

    async fn upsert(&self, user: NewUser) -> Result<User> {
        let mut tables = self.tables.lock().await;

        let existing = tables
            .users
            .values()
            .find(|u| u.email == user.email)
            .map(|u| u.id);

        match existing {
            Some(id) => {
                if tables
                    .users
                    .values()
                    .any(|u| u.id != id && u.username == user.username)
                {
                    return Err(StoreError::DuplicateUsername);
                }
                let row = tables
                    .users
                    .get_mut(&id.as_i64())
                    .ok_or_else(|| StoreError::not_found(Table::Users, id))?;
                row.username = user.username;
                row.updated_at = Utc::now();
                Ok(row.clone())
            }
            None => {
                check_unique(&tables, &user.email, &user.username, None)?;
                Ok(tables.insert(user))
            }
        }
    }

    async fn find_by_id(&self, id: UserId) -> Result<User> {
        let tables = self.tables.lock().await;
        live(&tables)
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(Table::Users, id))
    }

    async fn find_by_email(&self, email: &str) -> Result<User> {
        let tables = self.tables.lock().await;
        live(&tables)
            .find(|u| u.email == email)
            .cloned()
            .ok_or(StoreError::RowNotFound)
    }

    async fn find_all(&self, page: Page) -> Result<(Vec<User>, i64)> {
        let tables = self.tables.lock().await;
        let mut users: Vec<User> = live(&tables).cloned().collect();
        let total = users.len() as i64;

        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let users = users
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();

        Ok((users, total))
    }

    async fn find_with_filters(&self, filters: UserFilters) -> Result<Vec<User>> {
        let tables = self.tables.lock().await;
        Ok(live(&tables)
            .filter(|u| filters.matches(u))
            .cloned()
            .collect())
    }

    async fn update(&self, id: UserId, update: UserUpdate) -> Result<User> {
        let mut tables = self.tables.lock().await;
        let current = live_mut(&mut tables, id)?.clone();

        let mut updated = current;
        update.apply_to(&mut updated);
        check_unique(&tables, &updated.email, &updated.username, Some(id))?;

        let row = live_mut(&mut tables, id)?;
        updated.updated_at = Utc::now();
        *row = updated;
        Ok(row.clone())
    }

    async fn save(&self, user: &User) -> Result<()> {
        let mut tables = self.tables.lock().await;
        check_unique(&tables, &user.email, &user.username, Some(user.id))?;

        let row = live_mut(&mut tables, user.id)?;
        let created_at = row.created_at;
        *row = User {
            created_at,
            updated_at: Utc::now(),
            deleted_at: None,
            ..user.clone()
        };
        Ok(())
    }

    async fn update_last_login(&self, id: UserId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = live_mut(&mut tables, id)?;
        let now = Utc::now();
        row.last_login_at = Some(now);
        row.updated_at = now;
        Ok(())
    }

    async fn increase_login_count(&self, id: UserId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        live_mut(&mut tables, id)?.login_count += 1;
        Ok(())
    }

    async fn delete(&self, id: UserId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        live_mut(&mut tables, id)?.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn hard_delete(&self, id: UserId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&id.as_i64()) {
            return Err(StoreError::not_found(Table::Users, id));
        }
        if tables.orders.values().any(|o| o.user_id == id) {
            return Err(StoreError::StillReferenced {
                table: Table::Users,
                id: id.as_i64(),
                by: Table::Orders,
            });
        }
        remove_authored(&mut tables, id);
        tables.users.remove(&id.as_i64());
        Ok(())
    }

    async fn delete_inactive_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut deleted = 0;
        for user in tables.users.values_mut() {
            let stale = user.last_login_at.is_some_and(|at| at < before);
            if user.deleted_at.is_none() && !user.is_active && stale {
                user.deleted_at = Some(now);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn restore(&self, id: UserId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .users
            .get_mut(&id.as_i64())
            .filter(|u| u.deleted_at.is_some())
            .map(|u| u.deleted_at = None)
            .ok_or_else(|| StoreError::not_found(Table::Users, id))
    }

    async fn all_emails(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock().await;
        Ok(live(&tables).map(|u| u.email.clone()).collect())
    }

    async fn fetch_active_batch(&self, after: Option<UserId>, limit: u32) -> Result<Vec<User>> {
        let tables = self.tables.lock().await;
        Ok(live(&tables)
            .filter(|u| u.is_active && after.is_none_or(|after| u.id > after))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
