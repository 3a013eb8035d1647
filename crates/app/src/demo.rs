//! A short scripted run exercising every layer against one store.

use std::time::Duration;

use common::{Money, ProductId, UserId};
use domain::UserService;
use persistence::{
    NewComment, NewOrder, NewPost, NewProduct, NewTag, NewUser, Page, PostRepository, Scope, Store,
    StoreError, UserRepository, with_transaction,
};
use uuid::Uuid;
use workflows::{CreditTransfer, ItemRequest, OrderWorkflow, WorkflowError};

use crate::error::Result;

/// What a demo run did, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSummary {
    pub buyer: UserId,
    pub seller: UserId,
    pub order_total: Money,
    pub items_added: usize,
    pub items_rejected: usize,
    pub buyer_credits: i64,
    pub seller_credits: i64,
    pub overdraft_refused: bool,
    pub active_users_seen: u64,
    pub post_tags: i64,
    pub popular_posts: usize,
}

/// Seeds two accounts and a small catalogue, places an order with one
/// unsatisfiable line, moves credits between the accounts, then has the
/// seller publish a tagged post the buyer comments on.
///
/// Emails and tag slugs carry a random suffix so repeated runs against the
/// same database do not collide.
pub async fn run<S, R, P>(store: S, users: R, posts: P, timeout: Duration) -> Result<DemoSummary>
where
    S: Store + Clone,
    R: UserRepository,
    P: PostRepository,
{
    let service = UserService::new(users);
    let suffix = Uuid::new_v4().simple().to_string();
    let suffix = &suffix[..8];

    let buyer = service
        .create(
            NewUser::new(format!("buyer.{suffix}@example.com"), format!("buyer_{suffix}"))
                .with_name("Ada", "Buyer")
                .with_credits(100)
                .with_preferences(serde_json::json!({ "newsletter": true })),
        )
        .await?;
    let seller = service
        .create(
            NewUser::new(format!("seller.{suffix}@example.com"), format!("seller_{suffix}"))
                .with_name("Sam", "Seller")
                .with_credits(10),
        )
        .await?;
    tracing::info!(buyer = %buyer.id, seller = %seller.id, "accounts created");

    let (widget, gadget) = seed_catalogue(&store).await?;

    let orders = OrderWorkflow::new(store.clone()).with_timeout(timeout);
    let receipt = orders
        .create_order_with_items(
            NewOrder::for_user(buyer.id).with_note("demo order"),
            vec![ItemRequest::new(widget, 2), ItemRequest::new(gadget, 5)],
        )
        .await?;
    for rejected in &receipt.rejected {
        tracing::info!(index = rejected.index, error = %rejected.error, "line rejected");
    }
    tracing::info!(
        order_id = %receipt.order.id,
        total = %receipt.order.total,
        items = receipt.items.len(),
        "order placed"
    );

    let transfers = CreditTransfer::new(store).with_timeout(timeout);
    let moved = transfers.transfer_credits(buyer.id, seller.id, 50).await?;
    let overdraft_refused = match transfers.transfer_credits(buyer.id, seller.id, 200).await {
        Err(WorkflowError::InsufficientCredits {
            available,
            requested,
        }) => {
            tracing::info!(available, requested, "overdraft refused");
            true
        }
        Err(err) => return Err(err.into()),
        Ok(_) => false,
    };

    service.record_login(buyer.id).await?;
    let active_users_seen = service
        .process_active_in_batches(50, |batch| {
            tracing::debug!(batch = batch.len(), "processing active users");
            Ok(())
        })
        .await?;

    let post = posts
        .create_post(
            NewPost::new(seller.id, "Restocking soon", "More gadgets next week."),
            vec![NewTag::new(format!("news-{suffix}"), format!("news-{suffix}"))],
        )
        .await?;
    posts
        .append_tags(
            post.id,
            vec![NewTag::new(format!("gadgets-{suffix}"), format!("gadgets-{suffix}"))],
            Some(buyer.id),
        )
        .await?;
    posts
        .add_comment(NewComment::new(post.id, buyer.id, "Put me down for one."))
        .await?;
    let post_tags = posts.count_tags(post.id).await?;
    let popular_posts = posts
        .find_popular_posts(1)
        .await?
        .iter()
        .filter(|p| p.post.user_id == seller.id)
        .count();
    for details in posts.find_posts_with_details(Page::new(1, 5)).await? {
        tracing::debug!(
            post_id = %details.post.id,
            author = %details.author.username,
            tags = details.tags.len(),
            comments = details.comments.len(),
            "post loaded"
        );
    }

    Ok(DemoSummary {
        buyer: buyer.id,
        seller: seller.id,
        order_total: receipt.order.total,
        items_added: receipt.items.len(),
        items_rejected: receipt.rejected.len(),
        buyer_credits: moved.from_balance,
        seller_credits: moved.to_balance,
        overdraft_refused,
        active_users_seen,
        post_tags,
        popular_posts,
    })
}

async fn seed_catalogue<S: Store>(store: &S) -> Result<(ProductId, ProductId)> {
    let ids = with_transaction(store, |scope| {
        Box::pin(async move {
            let widget = scope
                .insert(NewProduct::new("Widget", Money::from_cents(250), 10))
                .await?;
            let gadget = scope
                .insert(NewProduct::new("Gadget", Money::from_cents(1999), 1))
                .await?;
            Ok::<_, StoreError>((widget.id, gadget.id))
        })
    })
    .await?;
    Ok(ids)
}
