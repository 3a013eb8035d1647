//! In-memory back end for tests and demos.

mod posts;
mod users;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{AuditLog, Comment, Order, OrderItem, Post, PostTag, Product, Tag, User};
use crate::{
    Adjustment, Filter, Insert, Record, Result, Savepoint, Scope, Store, StoreError, Table,
};

pub use posts::InMemoryPostRepository;
pub use users::InMemoryUserRepository;

/// Every table, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    pub(crate) users: BTreeMap<i64, User>,
    pub(crate) audit_logs: BTreeMap<i64, AuditLog>,
    pub(crate) products: BTreeMap<i64, Product>,
    pub(crate) orders: BTreeMap<i64, Order>,
    pub(crate) order_items: BTreeMap<i64, OrderItem>,
    pub(crate) posts: BTreeMap<i64, Post>,
    pub(crate) comments: BTreeMap<i64, Comment>,
    pub(crate) tags: BTreeMap<i64, Tag>,
    /// Keyed by `(post_id, tag_id)`.
    pub(crate) post_tags: BTreeMap<(i64, i64), PostTag>,
    sequences: HashMap<Table, i64>,
}

impl MemoryTables {
    pub(crate) fn next_id(&mut self, table: Table) -> i64 {
        let next = self.sequences.entry(table).or_insert(0);
        *next += 1;
        *next
    }

    pub(crate) fn insert<N: Insert>(&mut self, new: N) -> N::Output {
        let id = self.next_id(<N::Output as Record>::TABLE);
        let record = new.into_record(id, Utc::now());
        N::Output::rows_mut(self).insert(id, record.clone());
        record
    }

    /// Whether a row with this id exists, soft-deleted or not, as a
    /// foreign key sees it.
    pub(crate) fn contains(&self, table: Table, id: i64) -> bool {
        match table {
            Table::Users => self.users.contains_key(&id),
            Table::AuditLogs => self.audit_logs.contains_key(&id),
            Table::Products => self.products.contains_key(&id),
            Table::Orders => self.orders.contains_key(&id),
            Table::OrderItems => self.order_items.contains_key(&id),
            Table::Posts => self.posts.contains_key(&id),
            Table::Comments => self.comments.contains_key(&id),
            Table::Tags => self.tags.contains_key(&id),
        }
    }

    /// Fails with `NotFound` for the first reference of `new` that points at
    /// no row.
    pub(crate) fn check_references<N: Insert>(&self, new: &N) -> Result<()> {
        match new
            .references()
            .into_iter()
            .find(|r| !self.contains(r.table, r.id))
        {
            Some(reference) => Err(reference.missing()),
            None => Ok(()),
        }
    }

    fn adjust(&mut self, adjustment: Adjustment) -> Result<u64> {
        match adjustment.counter.table() {
            Table::Users => adjust_row::<User>(self, adjustment),
            Table::Products => adjust_row::<Product>(self, adjustment),
            Table::Orders => adjust_row::<Order>(self, adjustment),
            Table::AuditLogs => adjust_row::<AuditLog>(self, adjustment),
            Table::OrderItems => adjust_row::<OrderItem>(self, adjustment),
            Table::Posts => adjust_row::<Post>(self, adjustment),
            Table::Comments => adjust_row::<Comment>(self, adjustment),
            Table::Tags => adjust_row::<Tag>(self, adjustment),
        }
    }
}

fn adjust_row<R: Record>(tables: &mut MemoryTables, adjustment: Adjustment) -> Result<u64> {
    let column = adjustment.counter.column();
    let Some(row) = R::rows_mut(tables).get_mut(&adjustment.id) else {
        return Ok(0);
    };
    if !row.is_live() {
        return Ok(0);
    }
    let Some(current) = row.int_column(column) else {
        return Ok(0);
    };
    if !adjustment.admits(current) {
        return Ok(0);
    }
    let updated = current
        .checked_add(adjustment.delta)
        .ok_or(StoreError::OutOfRange {
            table: R::TABLE,
            column,
        })?;
    Ok(u64::from(row.set_int_column(column, updated)))
}

/// In-memory store implementation for testing.
///
/// Transactions are serialised: a scope holds the store's lock from
/// `begin` until it commits, rolls back or is dropped, which gives the
/// same guarantees as row locks and conditional updates in PostgreSQL.
/// Writes go to a working copy that replaces the committed tables on
/// commit; savepoints are snapshots of the working copy.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A user repository sharing this store's tables.
    pub fn users(&self) -> InMemoryUserRepository {
        InMemoryUserRepository::new(self.tables.clone())
    }

    /// A post repository sharing this store's tables.
    pub fn posts(&self) -> InMemoryPostRepository {
        InMemoryPostRepository::new(self.clone())
    }

    /// Returns a copy of the committed tables.
    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        *self.tables.lock().await = MemoryTables::default();
    }
}

impl MemoryTables {
    /// Committed rows of one table, in id order.
    pub fn all<R: Record>(&self) -> Vec<R> {
        R::rows(self).values().cloned().collect()
    }

    pub fn get<R: Record>(&self, id: i64) -> Option<&R> {
        R::rows(self).get(&id)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Scope = MemoryScope;

    async fn begin(&self) -> Result<MemoryScope> {
        let committed = self.tables.clone().lock_owned().await;
        let working = committed.clone();
        Ok(MemoryScope {
            committed,
            working,
            savepoints: Vec::new(),
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// An open in-memory transaction.
pub struct MemoryScope {
    committed: OwnedMutexGuard<MemoryTables>,
    working: MemoryTables,
    savepoints: Vec<MemoryTables>,
}

#[async_trait]
impl Scope for MemoryScope {
    async fn find<R: Record>(&mut self, id: i64) -> Result<Option<R>> {
        Ok(R::rows(&self.working)
            .get(&id)
            .filter(|row| row.is_live())
            .cloned())
    }

    async fn lock_for_update<R: Record>(&mut self, id: i64) -> Result<R> {
        self.find::<R>(id)
            .await?
            .ok_or_else(|| StoreError::not_found(R::TABLE, id))
    }

    async fn insert<N: Insert>(&mut self, new: N) -> Result<N::Output> {
        self.working.check_references(&new)?;
        Ok(self.working.insert(new))
    }

    async fn adjust(&mut self, adjustment: Adjustment) -> Result<u64> {
        self.working.adjust(adjustment)
    }

    async fn count<R: Record>(&mut self, filter: Filter) -> Result<i64> {
        let count = R::rows(&self.working)
            .values()
            .filter(|row| filter.matches(*row))
            .count();
        Ok(count as i64)
    }

    async fn select<R: Record>(&mut self, filter: Filter) -> Result<Vec<R>> {
        Ok(R::rows(&self.working)
            .values()
            .filter(|row| filter.matches(*row))
            .cloned()
            .collect())
    }

    async fn savepoint(&mut self) -> Result<Savepoint> {
        self.savepoints.push(self.working.clone());
        Ok(Savepoint::new(self.savepoints.len()))
    }

    async fn release(&mut self, savepoint: Savepoint) -> Result<()> {
        self.savepoints.truncate(savepoint.depth() - 1);
        Ok(())
    }

    async fn rollback_to(&mut self, savepoint: Savepoint) -> Result<()> {
        self.savepoints.truncate(savepoint.depth());
        if let Some(snapshot) = self.savepoints.pop() {
            self.working = snapshot;
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let MemoryScope {
            mut committed,
            working,
            ..
        } = self;
        *committed = working;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::{Money, OrderId, ProductId, UserId};

    use super::*;
    use crate::model::{NewOrder, NewOrderItem, NewProduct, NewUser};
    use crate::{Counter, nested, with_transaction};

    async fn seed_product(store: &InMemoryStore, stock: i64) -> ProductId {
        with_transaction(store, |scope| {
            Box::pin(async move {
                let product = scope
                    .insert(NewProduct::new("Widget", Money::from_cents(500), stock))
                    .await?;
                Ok::<_, StoreError>(product.id)
            })
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn commit_publishes_working_copy() {
        let store = InMemoryStore::new();
        let id = seed_product(&store, 3).await;

        let tables = store.snapshot().await;
        assert_eq!(tables.get::<Product>(id.as_i64()).unwrap().stock, 3);
    }

    #[tokio::test]
    async fn dropped_scope_discards_writes() {
        let store = InMemoryStore::new();
        {
            let mut scope = store.begin().await.unwrap();
            scope
                .insert(NewProduct::new("Ghost", Money::zero(), 1))
                .await
                .unwrap();
        }
        assert!(store.snapshot().await.all::<Product>().is_empty());
    }

    #[tokio::test]
    async fn conditional_decrement_refuses_to_go_negative() {
        let store = InMemoryStore::new();
        let id = seed_product(&store, 2).await;

        let mut scope = store.begin().await.unwrap();
        let over = Adjustment::decrement(Counter::ProductStock, id, 3);
        assert_eq!(scope.adjust(over).await.unwrap(), 0);
        let exact = Adjustment::decrement(Counter::ProductStock, id, 2);
        assert_eq!(scope.adjust(exact).await.unwrap(), 1);
        assert_eq!(
            scope.find::<Product>(id.as_i64()).await.unwrap().unwrap().stock,
            0
        );
    }

    #[tokio::test]
    async fn adjusting_missing_row_affects_nothing() {
        let store = InMemoryStore::new();
        let mut scope = store.begin().await.unwrap();
        let adj = Adjustment::increment(Counter::OrderTotal, 99, 10);
        assert_eq!(scope.adjust(adj).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn savepoint_rollback_keeps_earlier_work() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 10).await;

        let mut scope = store.begin().await.unwrap();
        let buyer = scope
            .insert(NewUser::new("buyer@example.com", "buyer"))
            .await
            .unwrap();
        let order = scope.insert(NewOrder::for_user(buyer.id)).await.unwrap();
        let order_id = order.id;

        let failed: Result<()> = nested(&mut scope, |sp| {
            Box::pin(async move {
                sp.adjust(Adjustment::decrement(Counter::ProductStock, product, 4))
                    .await?;
                Err(StoreError::not_found(Table::Products, product))
            })
        })
        .await;
        assert!(failed.is_err());

        let kept: Result<()> = nested(&mut scope, |sp| {
            Box::pin(async move {
                sp.insert(NewOrderItem {
                    order_id,
                    product_id: product,
                    quantity: 1,
                    unit_price: Money::from_cents(500),
                })
                .await?;
                Ok(())
            })
        })
        .await;
        assert!(kept.is_ok());
        scope.commit().await.unwrap();

        let tables = store.snapshot().await;
        assert_eq!(tables.get::<Product>(product.as_i64()).unwrap().stock, 10);
        assert_eq!(tables.all::<OrderItem>().len(), 1);
        assert_eq!(tables.all::<Order>().len(), 1);
    }

    #[tokio::test]
    async fn nested_savepoints_unwind_to_their_own_snapshot() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 10).await;
        let mut scope = store.begin().await.unwrap();

        let outer = scope.savepoint().await.unwrap();
        scope
            .adjust(Adjustment::decrement(Counter::ProductStock, product, 1))
            .await
            .unwrap();
        let inner = scope.savepoint().await.unwrap();
        scope
            .adjust(Adjustment::decrement(Counter::ProductStock, product, 5))
            .await
            .unwrap();
        scope.rollback_to(inner).await.unwrap();
        scope.release(outer).await.unwrap();

        let stock = scope
            .find::<Product>(product.as_i64())
            .await
            .unwrap()
            .unwrap()
            .stock;
        assert_eq!(stock, 9);
    }

    #[tokio::test]
    async fn count_and_select_apply_filter() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 10).await;
        let mut scope = store.begin().await.unwrap();
        let buyer = scope
            .insert(NewUser::new("buyer@example.com", "buyer"))
            .await
            .unwrap();
        let first = scope.insert(NewOrder::for_user(buyer.id)).await.unwrap();
        let second = scope.insert(NewOrder::for_user(buyer.id)).await.unwrap();
        for order in [first.id, first.id, second.id] {
            scope
                .insert(NewOrderItem {
                    order_id: order,
                    product_id: product,
                    quantity: 1,
                    unit_price: Money::from_cents(1),
                })
                .await
                .unwrap();
        }

        let filter = Filter::all().eq("order_id", first.id);
        assert_eq!(scope.count::<OrderItem>(filter.clone()).await.unwrap(), 2);
        let items = scope.select::<OrderItem>(filter).await.unwrap();
        assert!(items.iter().all(|i| i.order_id == first.id));
    }

    #[tokio::test]
    async fn insert_with_missing_reference_is_not_found() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, 10).await;
        let mut scope = store.begin().await.unwrap();

        let err = scope
            .insert(NewOrder::for_user(UserId::new(42)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotFound {
                table: Table::Users,
                id: 42
            }
        ));

        let err = scope
            .insert(NewOrderItem {
                order_id: OrderId::new(7),
                product_id: product,
                quantity: 1,
                unit_price: Money::from_cents(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotFound {
                table: Table::Orders,
                id: 7
            }
        ));
        assert!(scope.select::<Order>(Filter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn increment_past_bigint_is_out_of_range() {
        let store = InMemoryStore::new();
        let mut scope = store.begin().await.unwrap();
        let rich = scope
            .insert(NewUser::new("rich@example.com", "rich").with_credits(i64::MAX))
            .await
            .unwrap();

        let err = scope
            .adjust(Adjustment::increment(Counter::UserCredits, rich.id, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::OutOfRange {
                table: Table::Users,
                column: "credits"
            }
        ));
        let stored = scope.find::<User>(rich.id.as_i64()).await.unwrap().unwrap();
        assert_eq!(stored.credits, i64::MAX);
    }

    #[tokio::test]
    async fn lock_for_update_hides_soft_deleted_rows() {
        let store = InMemoryStore::new();
        let mut scope = store.begin().await.unwrap();
        let user = scope
            .insert(NewUser::new("gone@example.com", "gone"))
            .await
            .unwrap();
        User::rows_mut(&mut scope.working)
            .get_mut(&user.id.as_i64())
            .unwrap()
            .deleted_at = Some(Utc::now());

        let err = scope
            .lock_for_update::<User>(user.id.as_i64())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotFound {
                table: Table::Users,
                ..
            }
        ));
    }
}
