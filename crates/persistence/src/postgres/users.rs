use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::UserId;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::model::{FK_ORDERS_USER, NewAuditLog, NewUser, User};
use crate::users::{
    CREATE_BATCH_SIZE, Page, UserFilters, UserRepository, UserUpdate, contains_pattern,
};
use crate::{Insert, Record, Result, StoreError, Table};

const LIVE: &str = "deleted_at IS NULL";

/// PostgreSQL-backed user repository.
#[derive(Clone)]
pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn rows_to_users(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<User>> {
        Ok(rows
            .iter()
            .map(User::from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    fn insert_query(users: &[NewUser]) -> QueryBuilder<'static, Postgres> {
        let mut query = QueryBuilder::new(format!(
            "INSERT INTO users ({}) VALUES ",
            NewUser::COLUMNS.join(", ")
        ));
        for (i, user) in users.iter().enumerate() {
            if i > 0 {
                query.push(", ");
            }
            query.push("(");
            user.push_values(&mut query);
            query.push(")");
        }
        query
    }

    /// Maps "no row changed" to `NotFound`.
    fn expect_row(rows_affected: u64, id: UserId) -> Result<()> {
        if rows_affected == 0 {
            return Err(StoreError::not_found(Table::Users, id));
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    #[tracing::instrument(skip(self, user), fields(username = %user.username))]
    async fn create(&self, user: NewUser) -> Result<User> {
        let mut tx = self.pool.begin().await?;

        let mut query = Self::insert_query(std::slice::from_ref(&user));
        query.push(" RETURNING *");
        let row = query.build().fetch_one(&mut *tx).await?;
        let created = User::from_row(&row)?;

        let audit = NewAuditLog::user_created(created.id);
        let mut query = QueryBuilder::new(format!(
            "INSERT INTO audit_logs ({}) VALUES (",
            NewAuditLog::COLUMNS.join(", ")
        ));
        audit.push_values(&mut query);
        query.push(")");
        query.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn create_batch(&self, users: Vec<NewUser>) -> Result<Vec<User>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(users.len());

        for chunk in users.chunks(CREATE_BATCH_SIZE) {
            let mut query = Self::insert_query(chunk);
            query.push(" RETURNING *");
            let rows = query.build().fetch_all(&mut *tx).await?;
            created.extend(Self::rows_to_users(rows)?);
        }

        tx.commit().await?;
        created.sort_by_key(|u| u.id);
        Ok(created)
    }

    async fn upsert(&self, user: NewUser) -> Result<User> {
        let mut query = Self::insert_query(std::slice::from_ref(&user));
        query.push(
            " ON CONFLICT (email) DO UPDATE SET \
             username = EXCLUDED.username, updated_at = NOW() RETURNING *",
        );
        let row = query.build().fetch_one(&self.pool).await?;
        Ok(User::from_row(&row)?)
    }

    async fn find_by_id(&self, id: UserId) -> Result<User> {
        let row = sqlx::query(&format!("SELECT * FROM users WHERE id = $1 AND {LIVE}"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(Table::Users, id))?;
        Ok(User::from_row(&row)?)
    }

    async fn find_by_email(&self, email: &str) -> Result<User> {
        let row = sqlx::query(&format!("SELECT * FROM users WHERE email = $1 AND {LIVE}"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RowNotFound)?;
        Ok(User::from_row(&row)?)
    }

    async fn find_all(&self, page: Page) -> Result<(Vec<User>, i64)> {
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM users WHERE {LIVE}"))
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM users WHERE {LIVE} ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok((Self::rows_to_users(rows)?, total))
    }

    async fn find_with_filters(&self, filters: UserFilters) -> Result<Vec<User>> {
        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT * FROM users WHERE {LIVE}"));

        if let Some(active) = filters.is_active {
            query.push(" AND is_active = ").push_bind(active);
        }
        if let Some(fragment) = filters.username {
            query
                .push(" AND username ILIKE ")
                .push_bind(contains_pattern(&fragment))
                .push(r" ESCAPE '\'");
        }
        if let Some(after) = filters.created_after {
            query.push(" AND created_at > ").push_bind(after);
        }
        query.push(" ORDER BY id ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        Self::rows_to_users(rows)
    }

    async fn update(&self, id: UserId, update: UserUpdate) -> Result<User> {
        let mut query = QueryBuilder::<Postgres>::new("UPDATE users SET updated_at = NOW()");
        if let Some(v) = update.first_name {
            query.push(", first_name = ").push_bind(v);
        }
        if let Some(v) = update.last_name {
            query.push(", last_name = ").push_bind(v);
        }
        if let Some(v) = update.email {
            query.push(", email = ").push_bind(v);
        }
        if let Some(v) = update.username {
            query.push(", username = ").push_bind(v);
        }
        if let Some(v) = update.is_active {
            query.push(", is_active = ").push_bind(v);
        }
        if let Some(v) = update.preferences {
            query.push(", preferences = ").push_bind(v);
        }
        query
            .push(" WHERE id = ")
            .push_bind(id.as_i64())
            .push(format!(" AND {LIVE} RETURNING *"));

        let row = query
            .build()
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(Table::Users, id))?;
        Ok(User::from_row(&row)?)
    }

    async fn save(&self, user: &User) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE users SET
                first_name = $2, last_name = $3, email = $4, username = $5, role = $6,
                is_active = $7, credits = $8, login_count = $9, last_login_at = $10,
                preferences = $11, updated_at = NOW()
            WHERE id = $1 AND {LIVE}
            "#
        ))
        .bind(user.id.as_i64())
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .bind(&user.username)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.credits)
        .bind(user.login_count)
        .bind(user.last_login_at)
        .bind(&user.preferences)
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), user.id)
    }

    async fn update_last_login(&self, id: UserId) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE users SET last_login_at = NOW(), updated_at = NOW() WHERE id = $1 AND {LIVE}"
        ))
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), id)
    }

    async fn increase_login_count(&self, id: UserId) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE users SET login_count = login_count + 1 WHERE id = $1 AND {LIVE}"
        ))
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), id)
    }

    async fn delete(&self, id: UserId) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE users SET deleted_at = NOW() WHERE id = $1 AND {LIVE}"
        ))
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), id)
    }

    async fn hard_delete(&self, id: UserId) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(ref db_err)
                    if db_err.constraint() == Some(FK_ORDERS_USER) =>
                {
                    StoreError::StillReferenced {
                        table: Table::Users,
                        id: id.as_i64(),
                        by: Table::Orders,
                    }
                }
                err => err.into(),
            })?;

        Self::expect_row(result.rows_affected(), id)
    }

    async fn delete_inactive_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE users SET deleted_at = NOW() \
             WHERE is_active = FALSE AND last_login_at < $1 AND {LIVE}"
        ))
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn restore(&self, id: UserId) -> Result<()> {
        let result =
            sqlx::query("UPDATE users SET deleted_at = NULL WHERE id = $1 AND deleted_at IS NOT NULL")
                .bind(id.as_i64())
                .execute(&self.pool)
                .await?;

        Self::expect_row(result.rows_affected(), id)
    }

    async fn all_emails(&self) -> Result<Vec<String>> {
        let emails = sqlx::query_scalar(&format!("SELECT email FROM users WHERE {LIVE} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(emails)
    }

    async fn fetch_active_batch(&self, after: Option<UserId>, limit: u32) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM users WHERE is_active = TRUE AND {LIVE} AND id > $1 ORDER BY id LIMIT $2"
        ))
        .bind(after.map_or(0, |id| id.as_i64()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_users(rows)
    }
}
