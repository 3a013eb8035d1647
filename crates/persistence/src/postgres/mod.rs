//! PostgreSQL back end.

mod posts;
mod users;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::record::missing_reference;
use crate::{
    Adjustment, Filter, Insert, Record, Result, Savepoint, Scope, Store, StoreError,
    transaction::with_deadline,
};

pub use posts::PostgresPostRepository;
pub use users::PostgresUserRepository;

/// SQLSTATE `numeric_value_out_of_range`.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

fn is_out_of_range(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE)
    )
}

/// Deadline for [`Store::health_check`].
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or in use.
    pub size: u32,
    pub idle: usize,
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// A user repository sharing this store's pool.
    pub fn users(&self) -> PostgresUserRepository {
        PostgresUserRepository::new(self.pool.clone())
    }

    /// A post repository sharing this store's pool.
    pub fn posts(&self) -> PostgresPostRepository {
        PostgresPostRepository::new(self.pool.clone())
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// Closes every pooled connection. Pending scopes keep theirs until
    /// they finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Scope = PgScope;

    async fn begin(&self) -> Result<PgScope> {
        let tx = self.pool.begin().await?;
        Ok(PgScope { tx, depth: 0 })
    }

    async fn health_check(&self) -> Result<()> {
        with_deadline(Some(HEALTH_CHECK_TIMEOUT), async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }
}

/// A transaction on one pooled connection.
///
/// Savepoints are issued as plain `SAVEPOINT` statements on the same
/// connection, so nested scopes share the outer transaction's locks.
pub struct PgScope {
    tx: Transaction<'static, Postgres>,
    depth: usize,
}

impl PgScope {
    fn select_sql<R: Record>(filter: &Filter) -> QueryBuilder<'static, Postgres> {
        let mut query = QueryBuilder::new(format!("SELECT * FROM {}", R::TABLE));
        filter.push_where(R::TABLE, &mut query);
        query
    }

    async fn execute(&mut self, sql: String) -> Result<()> {
        sqlx::Executor::execute(&mut *self.tx, sqlx::raw_sql(&sql)).await?;
        Ok(())
    }
}

#[async_trait]
impl Scope for PgScope {
    async fn find<R: Record>(&mut self, id: i64) -> Result<Option<R>> {
        let mut query = Self::select_sql::<R>(&Filter::all().eq("id", id));
        let row = query.build().fetch_optional(&mut *self.tx).await?;
        Ok(row.as_ref().map(R::from_row).transpose()?)
    }

    async fn lock_for_update<R: Record>(&mut self, id: i64) -> Result<R> {
        let mut query = Self::select_sql::<R>(&Filter::all().eq("id", id));
        query.push(" FOR UPDATE");
        let row = query
            .build()
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::not_found(R::TABLE, id))?;
        Ok(R::from_row(&row)?)
    }

    async fn insert<N: Insert>(&mut self, new: N) -> Result<N::Output> {
        let table = <N::Output as Record>::TABLE;
        let mut query = QueryBuilder::new(format!(
            "INSERT INTO {table} ({}) VALUES (",
            N::COLUMNS.join(", ")
        ));
        new.push_values(&mut query);
        query.push(") RETURNING *");

        let row = match query.build().fetch_one(&mut *self.tx).await {
            Ok(row) => row,
            Err(err) => {
                return Err(missing_reference(&new.references(), &err)
                    .unwrap_or_else(|| err.into()));
            }
        };
        Ok(N::Output::from_row(&row)?)
    }

    async fn adjust(&mut self, adjustment: Adjustment) -> Result<u64> {
        let table = adjustment.counter.table();
        let column = adjustment.counter.column();

        let mut query = QueryBuilder::new(format!("UPDATE {table} SET {column} = {column} + "));
        query.push_bind(adjustment.delta);
        if table.soft_deletes() {
            query.push(", updated_at = NOW()");
        }
        query.push(" WHERE id = ").push_bind(adjustment.id);
        if let Some(floor) = adjustment.floor {
            query.push(format!(" AND {column} >= ")).push_bind(floor);
        }
        if table.soft_deletes() {
            query.push(" AND deleted_at IS NULL");
        }

        let result = match query.build().execute(&mut *self.tx).await {
            Ok(result) => result,
            Err(err) if is_out_of_range(&err) => {
                return Err(StoreError::OutOfRange { table, column });
            }
            Err(err) => return Err(err.into()),
        };
        Ok(result.rows_affected())
    }

    async fn count<R: Record>(&mut self, filter: Filter) -> Result<i64> {
        let mut query = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", R::TABLE));
        filter.push_where(R::TABLE, &mut query);
        let count = query
            .build_query_scalar::<i64>()
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count)
    }

    async fn select<R: Record>(&mut self, filter: Filter) -> Result<Vec<R>> {
        let mut query = Self::select_sql::<R>(&filter);
        query.push(" ORDER BY id ASC");
        let rows = query.build().fetch_all(&mut *self.tx).await?;
        Ok(rows.iter().map(R::from_row).collect::<std::result::Result<_, _>>()?)
    }

    async fn savepoint(&mut self) -> Result<Savepoint> {
        self.depth += 1;
        let savepoint = Savepoint::new(self.depth);
        if let Err(err) = self.execute(format!("SAVEPOINT {}", savepoint.name())).await {
            self.depth -= 1;
            return Err(err);
        }
        Ok(savepoint)
    }

    async fn release(&mut self, savepoint: Savepoint) -> Result<()> {
        self.execute(format!("RELEASE SAVEPOINT {}", savepoint.name()))
            .await?;
        self.depth = savepoint.depth() - 1;
        Ok(())
    }

    async fn rollback_to(&mut self, savepoint: Savepoint) -> Result<()> {
        let name = savepoint.name();
        self.execute(format!("ROLLBACK TO SAVEPOINT {name}")).await?;
        self.execute(format!("RELEASE SAVEPOINT {name}")).await?;
        self.depth = savepoint.depth() - 1;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
