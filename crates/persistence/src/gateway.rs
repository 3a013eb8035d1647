use async_trait::async_trait;

use crate::{Filter, Insert, Record, Result, Table};

/// Integer columns that may be changed through [`Scope::adjust`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// `products.stock`
    ProductStock,
    /// `users.credits`
    UserCredits,
    /// `users.login_count`
    UserLoginCount,
    /// `orders.total_cents`
    OrderTotal,
}

impl Counter {
    pub fn table(&self) -> Table {
        match self {
            Counter::ProductStock => Table::Products,
            Counter::UserCredits | Counter::UserLoginCount => Table::Users,
            Counter::OrderTotal => Table::Orders,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Counter::ProductStock => "stock",
            Counter::UserCredits => "credits",
            Counter::UserLoginCount => "login_count",
            Counter::OrderTotal => "total_cents",
        }
    }
}

/// A single atomic conditional update:
///
/// ```sql
/// UPDATE <table> SET <column> = <column> + <delta>
/// WHERE id = <id> [AND <column> >= <floor>]
/// ```
///
/// The guard and the write happen in one statement, so two concurrent
/// decrements can never both pass the check against the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub counter: Counter,
    pub id: i64,
    pub delta: i64,
    pub floor: Option<i64>,
}

impl Adjustment {
    /// Subtracts `amount`, only when the current value is at least `amount`.
    pub fn decrement(counter: Counter, id: impl Into<i64>, amount: i64) -> Self {
        Self {
            counter,
            id: id.into(),
            delta: -amount,
            floor: Some(amount),
        }
    }

    /// Adds `amount` unconditionally.
    pub fn increment(counter: Counter, id: impl Into<i64>, amount: i64) -> Self {
        Self {
            counter,
            id: id.into(),
            delta: amount,
            floor: None,
        }
    }

    /// Whether a row holding `current` passes the guard.
    pub fn admits(&self, current: i64) -> bool {
        self.floor.is_none_or(|floor| current >= floor)
    }
}

/// A savepoint opened with [`Scope::savepoint`].
///
/// Consumed by exactly one of [`Scope::release`] or [`Scope::rollback_to`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a savepoint must be released or rolled back"]
pub struct Savepoint {
    depth: usize,
}

impl Savepoint {
    pub(crate) fn new(depth: usize) -> Self {
        Self { depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn name(&self) -> String {
        format!("scope_sp_{}", self.depth)
    }
}

/// An open transaction.
///
/// Dropping a scope without calling [`Scope::commit`] rolls it back.
#[async_trait]
pub trait Scope: Send {
    /// Reads a live row by id.
    async fn find<R: Record>(&mut self, id: i64) -> Result<Option<R>>;

    /// Reads a live row by id and holds a row lock on it until the
    /// transaction ends (`SELECT … FOR UPDATE`).
    ///
    /// Fails with `NotFound` when the row is absent.
    async fn lock_for_update<R: Record>(&mut self, id: i64) -> Result<R>;

    /// Inserts a row and returns it with its assigned id.
    async fn insert<N: Insert>(&mut self, new: N) -> Result<N::Output>;

    /// Applies a conditional update and returns the number of rows affected.
    async fn adjust(&mut self, adjustment: Adjustment) -> Result<u64>;

    /// Counts live rows matching `filter`.
    async fn count<R: Record>(&mut self, filter: Filter) -> Result<i64>;

    /// Loads live rows matching `filter`, ordered by id.
    async fn select<R: Record>(&mut self, filter: Filter) -> Result<Vec<R>>;

    /// Opens a savepoint nested in the current transaction.
    async fn savepoint(&mut self) -> Result<Savepoint>;

    /// Keeps the work done since `savepoint`.
    async fn release(&mut self, savepoint: Savepoint) -> Result<()>;

    /// Discards the work done since `savepoint`; the transaction stays usable.
    async fn rollback_to(&mut self, savepoint: Savepoint) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// A transactional data store.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Store: Send + Sync {
    type Scope: Scope;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Scope>;

    /// Verifies the store is reachable.
    async fn health_check(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_guards_against_going_negative() {
        let adj = Adjustment::decrement(Counter::ProductStock, 1, 5);
        assert_eq!(adj.delta, -5);
        assert!(adj.admits(5));
        assert!(!adj.admits(4));
    }

    #[test]
    fn increment_is_unconditional() {
        let adj = Adjustment::increment(Counter::UserCredits, 1, 5);
        assert!(adj.admits(i64::MIN));
    }

    #[test]
    fn counters_map_to_schema_columns() {
        assert_eq!(Counter::ProductStock.table(), Table::Products);
        assert_eq!(Counter::OrderTotal.column(), "total_cents");
        assert_eq!(Counter::UserCredits.table(), Table::Users);
    }

    #[test]
    fn savepoint_names_are_depth_scoped() {
        assert_eq!(Savepoint::new(2).name(), "scope_sp_2");
    }
}
