//! Order creation with one savepoint per item.

use std::time::{Duration, Instant};

use common::{OrderId, ProductId};
use persistence::{
    Adjustment, Counter, Filter, NewOrder, NewOrderItem, Order, OrderItem, Product, Scope, Store,
    StoreError, Table, nested, with_deadline, with_transaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{ItemError, Result, WorkflowError};

/// One requested order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl ItemRequest {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// An item that was not added, with its position in the request.
#[derive(Debug)]
pub struct RejectedItem {
    pub index: usize,
    pub request: ItemRequest,
    pub error: ItemError,
}

/// Result of a committed order.
#[derive(Debug)]
pub struct OrderReceipt {
    /// The order as committed, with its final total.
    pub order: Order,
    /// Persisted lines, in insertion order.
    pub items: Vec<OrderItem>,
    pub rejected: Vec<RejectedItem>,
}

/// An order header with its lines loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderWithItems {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// Creates orders whose items succeed or fail independently.
///
/// The whole order runs in one transaction. Each item gets its own
/// savepoint: stock is taken with a single conditional decrement, so two
/// concurrent orders can never both take the last unit, and a failed item
/// unwinds only its own writes. The order commits when at least one item
/// was added.
#[derive(Clone)]
pub struct OrderWorkflow<S: Store> {
    store: S,
    timeout: Option<Duration>,
}

impl<S: Store> OrderWorkflow<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    /// Bounds each call by `timeout`. On expiry the transaction is rolled
    /// back and the call fails with `StoreError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Inserts `order` and as many of `items` as stock allows.
    ///
    /// Fails with [`WorkflowError::NoItemsAdded`] when every item is
    /// rejected, in which case nothing is written.
    #[tracing::instrument(skip(self, order, items), fields(user_id = %order.user_id, items = items.len()))]
    pub async fn create_order_with_items(
        &self,
        order: NewOrder,
        items: Vec<ItemRequest>,
    ) -> Result<OrderReceipt> {
        let started = Instant::now();

        let result = with_deadline(
            self.timeout,
            with_transaction(&self.store, |scope| {
                Box::pin(async move {
                    let mut order = scope.insert(order).await?;
                    let order_id = order.id;
                    tracing::debug!(%order_id, "order header inserted");

                    let mut added_items = Vec::new();
                    let mut rejected = Vec::new();
                    for (index, request) in items.into_iter().enumerate() {
                        let added =
                            nested(scope, |sp| Box::pin(add_item(sp, order_id, request))).await;
                        match added {
                            Ok(item) => {
                                tracing::debug!(%order_id, item_id = %item.id, "order item added");
                                added_items.push(item);
                            }
                            Err(ItemError::Store(err)) if err.is_transient() => {
                                return Err(err.into());
                            }
                            Err(error) => {
                                tracing::warn!(
                                    %order_id,
                                    index,
                                    product_id = %request.product_id,
                                    quantity = request.quantity,
                                    %error,
                                    "order item rejected"
                                );
                                rejected.push(RejectedItem {
                                    index,
                                    request,
                                    error,
                                });
                            }
                        }
                    }

                    let lines = Filter::all().eq("order_id", order_id);
                    if scope.count::<OrderItem>(lines).await? == 0 {
                        return Err(WorkflowError::NoItemsAdded { rejected });
                    }

                    // Mirrors the `total_cents` increments made by each kept item.
                    order.total = added_items.iter().map(OrderItem::line_total).sum();
                    Ok::<_, WorkflowError>(OrderReceipt {
                        order,
                        items: added_items,
                        rejected,
                    })
                })
            }),
        )
        .await;

        metrics::histogram!("workflow_duration_seconds", "workflow" => "create_order")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(receipt) => {
                metrics::counter!("orders_created_total").increment(1);
                metrics::counter!("order_items_rejected_total")
                    .increment(receipt.rejected.len() as u64);
                tracing::info!(
                    order_id = %receipt.order.id,
                    added = receipt.items.len(),
                    rejected = receipt.rejected.len(),
                    total = %receipt.order.total,
                    "order created"
                );
                Ok(receipt)
            }
            Err(err) => {
                if let WorkflowError::NoItemsAdded { ref rejected } = err {
                    metrics::counter!("order_items_rejected_total")
                        .increment(rejected.len() as u64);
                }
                tracing::warn!(error = %err, "order creation failed");
                Err(err)
            }
        }
    }

    /// Loads an order with all of its items.
    #[tracing::instrument(skip(self))]
    pub async fn load_order(&self, order_id: OrderId) -> Result<OrderWithItems> {
        with_deadline(
            self.timeout,
            with_transaction(&self.store, |scope| {
                Box::pin(async move {
                    let order = scope
                        .find::<Order>(order_id.as_i64())
                        .await?
                        .ok_or_else(|| StoreError::not_found(Table::Orders, order_id))?;
                    let items = scope
                        .select::<OrderItem>(Filter::all().eq("order_id", order_id))
                        .await?;
                    Ok::<_, WorkflowError>(OrderWithItems { order, items })
                })
            }),
        )
        .await
    }
}

/// Takes stock for one item and writes its line. Runs inside the item's
/// savepoint; any error unwinds just this item.
async fn add_item<Sc: Scope>(
    scope: &mut Sc,
    order_id: OrderId,
    request: ItemRequest,
) -> std::result::Result<OrderItem, ItemError> {
    let ItemRequest {
        product_id,
        quantity,
    } = request;
    if quantity == 0 {
        return Err(ItemError::InvalidQuantity);
    }

    let take = Adjustment::decrement(Counter::ProductStock, product_id, i64::from(quantity));
    if scope.adjust(take).await? == 0 {
        return Err(match scope.find::<Product>(product_id.as_i64()).await? {
            Some(product) => ItemError::InsufficientStock {
                product_id,
                requested: quantity,
                available: product.stock,
            },
            None => ItemError::ProductNotFound(product_id),
        });
    }

    // The decrement holds the product row lock, so this price is the one
    // in force when the stock was taken.
    let product = scope
        .find::<Product>(product_id.as_i64())
        .await?
        .ok_or(ItemError::ProductNotFound(product_id))?;

    let item = scope
        .insert(NewOrderItem {
            order_id,
            product_id,
            quantity,
            unit_price: product.price,
        })
        .await?;

    let add_total = Adjustment::increment(Counter::OrderTotal, order_id, item.line_total().cents());
    if scope.adjust(add_total).await? == 0 {
        return Err(StoreError::not_found(Table::Orders, order_id).into());
    }

    Ok(item)
}
