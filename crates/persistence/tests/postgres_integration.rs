//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p persistence --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use persistence::{
    Adjustment, Counter, Filter, Money, NewComment, NewOrder, NewOrderItem, NewPost, NewProduct,
    NewTag, NewUser, Order, OrderId, OrderItem, Page, PostRepository, PostgresStore, Product,
    Scope, Store, StoreError, Table, User, UserFilters, UserId, UserRepository,
    UserRepositoryExt, UserUpdate, nested, with_deadline, with_transaction,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/002_create_posts.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE post_tags, tags, comments, posts, order_items, orders, products, \
         audit_logs, users RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

async fn seed(store: &PostgresStore, stock: i64) -> (User, Product) {
    let user = store
        .users()
        .create(NewUser::new("buyer@example.com", "buyer"))
        .await
        .unwrap();
    let product = with_transaction(store, |scope| {
        Box::pin(async move {
            scope
                .insert(NewProduct::new("Widget", Money::from_cents(250), stock))
                .await
        })
    })
    .await
    .unwrap();
    (user, product)
}

#[tokio::test]
#[serial]
async fn health_check_and_pool_stats() {
    let store = get_test_store().await;
    store.health_check().await.unwrap();
    assert!(store.pool_stats().size >= 1);
}

#[tokio::test]
#[serial]
async fn conditional_decrement_guards_stock() {
    let store = get_test_store().await;
    let (_, product) = seed(&store, 3).await;

    let mut scope = store.begin().await.unwrap();
    let over = Adjustment::decrement(Counter::ProductStock, product.id, 4);
    assert_eq!(scope.adjust(over).await.unwrap(), 0);
    let exact = Adjustment::decrement(Counter::ProductStock, product.id, 3);
    assert_eq!(scope.adjust(exact).await.unwrap(), 1);
    scope.commit().await.unwrap();

    let mut scope = store.begin().await.unwrap();
    let stored: Product = scope.find(product.id.as_i64()).await.unwrap().unwrap();
    assert_eq!(stored.stock, 0);
}

#[tokio::test]
#[serial]
async fn savepoint_rollback_keeps_outer_work() {
    let store = get_test_store().await;
    let (user, product) = seed(&store, 10).await;
    let user_id = user.id;
    let product_id = product.id;

    let order = with_transaction(&store, |scope| {
        Box::pin(async move {
            let order = scope.insert(NewOrder::for_user(user_id)).await?;
            let order_id = order.id;

            let failed: Result<(), StoreError> = nested(scope, |sp| {
                Box::pin(async move {
                    sp.adjust(Adjustment::decrement(Counter::ProductStock, product_id, 4))
                        .await?;
                    Err(StoreError::not_found(Table::Products, 0))
                })
            })
            .await;
            assert!(failed.is_err());

            nested(scope, |sp| {
                Box::pin(async move {
                    sp.insert(NewOrderItem {
                        order_id,
                        product_id,
                        quantity: 2,
                        unit_price: Money::from_cents(250),
                    })
                    .await
                })
            })
            .await?;
            Ok::<_, StoreError>(order)
        })
    })
    .await
    .unwrap();

    let mut scope = store.begin().await.unwrap();
    let stored: Product = scope.find(product_id.as_i64()).await.unwrap().unwrap();
    assert_eq!(stored.stock, 10);
    let items = scope
        .count::<OrderItem>(Filter::all().eq("order_id", order.id))
        .await
        .unwrap();
    assert_eq!(items, 1);
}

#[tokio::test]
#[serial]
async fn failed_transaction_rolls_back_everything() {
    let store = get_test_store().await;
    let (user, _) = seed(&store, 1).await;
    let user_id = user.id;

    let result: Result<(), StoreError> = with_transaction(&store, |scope| {
        Box::pin(async move {
            scope.insert(NewOrder::for_user(user_id)).await?;
            Err(StoreError::not_found(Table::Orders, 0))
        })
    })
    .await;
    assert!(result.is_err());

    let mut scope = store.begin().await.unwrap();
    assert_eq!(scope.count::<Order>(Filter::all()).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn lock_for_update_reports_missing_rows() {
    let store = get_test_store().await;
    let mut scope = store.begin().await.unwrap();

    let err = scope.lock_for_update::<User>(42).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound {
            table: Table::Users,
            id: 42
        }
    ));
}

#[tokio::test]
#[serial]
async fn deadline_expiry_rolls_back() {
    let store = get_test_store().await;
    let (user, _) = seed(&store, 1).await;
    let user_id = user.id;

    let result: Result<(), StoreError> = with_deadline(
        Some(Duration::from_millis(50)),
        with_transaction(&store, |scope| {
            Box::pin(async move {
                scope.insert(NewOrder::for_user(user_id)).await?;
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
        }),
    )
    .await;
    assert!(matches!(result, Err(StoreError::Timeout(_))));

    let mut scope = store.begin().await.unwrap();
    assert_eq!(scope.count::<Order>(Filter::all()).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn user_create_maps_unique_violations() {
    let store = get_test_store().await;
    let repo = store.users();

    let user = repo
        .create(NewUser::new("alice@example.com", "alice"))
        .await
        .unwrap();
    assert_eq!(repo.find_by_email("alice@example.com").await.unwrap().id, user.id);

    let err = repo
        .create(NewUser::new("alice@example.com", "alice2"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateEmail));

    let err = repo
        .create(NewUser::new("other@example.com", "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateUsername));

    let audit: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs WHERE entity_id = $1")
        .bind(user.id.as_i64())
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(audit, 1);
}

#[tokio::test]
#[serial]
async fn user_soft_delete_restore_and_filters() {
    let store = get_test_store().await;
    let repo = store.users();

    let users = repo
        .create_batch(vec![
            NewUser::new("bob@example.com", "Bobby"),
            NewUser::new("carol@example.com", "carol").inactive(),
        ])
        .await
        .unwrap();
    let bob = users[0].id;

    let found = repo
        .find_with_filters(UserFilters {
            username: Some("bob".to_string()),
            is_active: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    repo.delete(bob).await.unwrap();
    assert!(repo.find_by_id(bob).await.unwrap_err().is_not_found());
    let (_, total) = repo.find_all(Page::default()).await.unwrap();
    assert_eq!(total, 1);

    repo.restore(bob).await.unwrap();
    assert_eq!(repo.all_emails().await.unwrap().len(), 2);
}

#[tokio::test]
#[serial]
async fn user_update_and_counters() {
    let store = get_test_store().await;
    let repo = store.users();
    let user = repo
        .create(NewUser::new("dave@example.com", "dave").with_name("Dave", "Jones"))
        .await
        .unwrap();

    let updated = repo
        .update(
            user.id,
            UserUpdate {
                first_name: Some("David".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.first_name.as_deref(), Some("David"));
    assert_eq!(updated.last_name.as_deref(), Some("Jones"));

    repo.increase_login_count(user.id).await.unwrap();
    repo.update_last_login(user.id).await.unwrap();
    let stored = repo.find_by_id(user.id).await.unwrap();
    assert_eq!(stored.login_count, 1);
    assert!(stored.last_login_at.is_some());

    let upserted = repo
        .upsert(NewUser::new("dave@example.com", "dave_j"))
        .await
        .unwrap();
    assert_eq!(upserted.id, user.id);
    assert_eq!(upserted.username, "dave_j");
}

#[tokio::test]
#[serial]
async fn stream_active_reads_all_pages() {
    let store = get_test_store().await;
    let repo = store.users();
    let batch = (0..250)
        .map(|i| NewUser::new(format!("user{i}@example.com"), format!("user{i}")))
        .collect();
    repo.create_batch(batch).await.unwrap();

    let streamed: Vec<User> = repo.stream_active().try_collect().await.unwrap();
    assert_eq!(streamed.len(), 250);
}

#[tokio::test]
#[serial]
async fn insert_with_missing_reference_is_not_found() {
    let store = get_test_store().await;
    let (_, product) = seed(&store, 5).await;

    let mut scope = store.begin().await.unwrap();
    let err = scope
        .insert(NewOrder::for_user(UserId::new(404)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound {
            table: Table::Users,
            id: 404
        }
    ));
    scope.rollback().await.unwrap();

    let mut scope = store.begin().await.unwrap();
    let err = scope
        .insert(NewOrderItem {
            order_id: OrderId::new(7),
            product_id: product.id,
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
}

#[tokio::test]
#[serial]
async fn increment_past_bigint_is_out_of_range() {
    let store = get_test_store().await;
    let rich = store
        .users()
        .create(NewUser::new("rich@example.com", "rich").with_credits(i64::MAX))
        .await
        .unwrap();

    let mut scope = store.begin().await.unwrap();
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
}

#[tokio::test]
#[serial]
async fn username_filter_matches_wildcards_literally() {
    let store = get_test_store().await;
    let repo = store.users();
    repo.create_batch(vec![
        NewUser::new("ab@example.com", "A_B"),
        NewUser::new("axb@example.com", "axb"),
        NewUser::new("pct@example.com", "half%off"),
    ])
    .await
    .unwrap();

    let found = repo
        .find_with_filters(UserFilters {
            username: Some("a_b".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, ["A_B"]);

    let found = repo
        .find_with_filters(UserFilters {
            username: Some("%".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].username, "half%off");
}

#[tokio::test]
#[serial]
async fn hard_delete_respects_foreign_keys() {
    let store = get_test_store().await;
    let (buyer, _) = seed(&store, 1).await;
    let repo = store.users();
    let buyer_id = buyer.id;
    with_transaction(&store, |scope| {
        Box::pin(async move {
            scope.insert(NewOrder::for_user(buyer_id)).await?;
            Ok::<_, StoreError>(())
        })
    })
    .await
    .unwrap();

    let err = repo.hard_delete(buyer.id).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::StillReferenced {
            table: Table::Users,
            by: Table::Orders,
            ..
        }
    ));

    let author = repo
        .create(NewUser::new("author@example.com", "author"))
        .await
        .unwrap();
    let post = store
        .posts()
        .create_post(
            NewPost::new(author.id, "Hello", ""),
            vec![NewTag::new("Rust", "rust")],
        )
        .await
        .unwrap();
    store
        .posts()
        .add_comment(NewComment::new(post.id, buyer.id, "hi"))
        .await
        .unwrap();

    repo.hard_delete(author.id).await.unwrap();
    assert_eq!(count_rows(&store, "posts").await, 0);
    assert_eq!(count_rows(&store, "comments").await, 0);
    assert_eq!(count_rows(&store, "post_tags").await, 0);
    assert_eq!(count_rows(&store, "tags").await, 1);
}

async fn count_rows(store: &PostgresStore, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(store.pool())
        .await
        .unwrap()
}

async fn user(store: &PostgresStore, name: &str) -> User {
    store
        .users()
        .create(NewUser::new(format!("{name}@example.com"), name))
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
async fn post_tag_associations() {
    let store = get_test_store().await;
    let posts = store.posts();
    let author = user(&store, "author").await;
    let editor = user(&store, "editor").await;

    let post = posts
        .create_post(
            NewPost::new(author.id, "Tagged", "body"),
            vec![NewTag::new("Rust", "rust"), NewTag::new("SQL", "sql")],
        )
        .await
        .unwrap();
    assert_eq!(posts.count_tags(post.id).await.unwrap(), 2);

    posts
        .append_tags(
            post.id,
            vec![NewTag::new("Rust", "rust"), NewTag::new("Go", "go")],
            Some(editor.id),
        )
        .await
        .unwrap();
    let links = posts.tag_links(post.id).await.unwrap();
    let added_by: Vec<_> = links.iter().map(|l| l.added_by).collect();
    assert_eq!(added_by, [Some(author.id), Some(author.id), Some(editor.id)]);

    let err = posts
        .append_tags(post.id, vec![NewTag::new("Rust", "rust-lang")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateTagName));

    let err = posts
        .append_tags(post.id, vec![NewTag::new("Db", "db")], Some(UserId::new(999)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound {
            table: Table::Users,
            id: 999
        }
    ));
    assert_eq!(posts.count_tags(post.id).await.unwrap(), 3);

    posts
        .replace_tags(post.id, vec![NewTag::new("Db", "db")], None)
        .await
        .unwrap();
    let tags = posts.tags(post.id).await.unwrap();
    let slugs: Vec<_> = tags.iter().map(|t| t.slug.as_str()).collect();
    assert_eq!(slugs, ["db"]);

    assert!(posts.remove_tag(post.id, "db").await.unwrap());
    assert!(!posts.remove_tag(post.id, "db").await.unwrap());
    posts
        .append_tags(post.id, vec![NewTag::new("Go", "go")], None)
        .await
        .unwrap();
    assert_eq!(posts.clear_tags(post.id).await.unwrap(), 1);
    assert_eq!(count_rows(&store, "tags").await, 4);

    posts.delete_post(post.id).await.unwrap();
    assert!(posts.count_tags(post.id).await.unwrap_err().is_not_found());
    assert!(posts.clear_tags(post.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[serial]
async fn post_for_missing_parent_is_not_found() {
    let store = get_test_store().await;
    let author = user(&store, "author").await;

    let err = store
        .posts()
        .create_post(
            NewPost::new(author.id, "Re", "").reply_to(persistence::PostId::new(404)),
            vec![NewTag::new("Rust", "rust")],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound {
            table: Table::Posts,
            id: 404
        }
    ));
    assert_eq!(count_rows(&store, "tags").await, 0);
}

#[tokio::test]
#[serial]
async fn post_queries_preload_join_and_aggregate() {
    let store = get_test_store().await;
    let posts = store.posts();
    let author = user(&store, "author").await;
    let reader = user(&store, "reader").await;

    let quiet = posts
        .create_post(NewPost::new(author.id, "Quiet", ""), vec![])
        .await
        .unwrap();
    let busy = posts
        .create_post(
            NewPost::new(author.id, "Busy", ""),
            vec![NewTag::new("Rust", "rust")],
        )
        .await
        .unwrap();
    let theirs = posts
        .create_post(NewPost::new(reader.id, "Theirs", "").reply_to(busy.id), vec![])
        .await
        .unwrap();

    let first = posts
        .add_comment(NewComment::new(busy.id, reader.id, "one"))
        .await
        .unwrap();
    let second = posts
        .add_comment(NewComment::new(busy.id, author.id, "two"))
        .await
        .unwrap();
    let removed = posts
        .add_comment(NewComment::new(quiet.id, reader.id, "gone"))
        .await
        .unwrap();
    posts.delete_comment(removed.id).await.unwrap();

    let details = posts.find_posts_with_details(Page::new(1, 2)).await.unwrap();
    let ids: Vec<_> = details.iter().map(|d| d.post.id).collect();
    assert_eq!(ids, [theirs.id, busy.id]);
    let busy_details = &details[1];
    assert_eq!(busy_details.author.id, author.id);
    assert_eq!(busy_details.tags[0].slug, "rust");
    let commenters: Vec<_> = busy_details
        .comments
        .iter()
        .map(|c| (c.comment.id, c.author.id))
        .collect();
    assert_eq!(commenters, [(first.id, reader.id), (second.id, author.id)]);

    let active = posts.find_posts_with_active_comments().await.unwrap();
    assert!(active[0].comments.is_empty());
    let newest_first: Vec<_> = active[1].comments.iter().map(|c| c.id).collect();
    assert_eq!(newest_first, [second.id, first.id]);

    let popular = posts.find_popular_posts(1).await.unwrap();
    assert_eq!(popular.len(), 1);
    assert_eq!(popular[0].post.id, busy.id);
    assert_eq!(popular[0].comment_count, 2);
    assert_eq!(posts.find_popular_posts(0).await.unwrap().len(), 3);

    let by_email = posts
        .find_posts_by_user_email("reader@example.com")
        .await
        .unwrap();
    assert_eq!(by_email, vec![theirs.clone()]);
    assert_eq!(posts.replies(busy.id).await.unwrap(), vec![theirs.clone()]);

    let summaries = posts.find_post_summaries().await.unwrap();
    let rows: Vec<_> = summaries
        .iter()
        .map(|s| (s.title.as_str(), s.user_name.as_str()))
        .collect();
    assert_eq!(
        rows,
        [("Quiet", "author"), ("Busy", "author"), ("Theirs", "reader")]
    );

    store.users().delete(reader.id).await.unwrap();
    let with_user = posts.find_posts_with_user().await.unwrap();
    assert_eq!(with_user.len(), 2);
    assert!(with_user.iter().all(|p| p.author.id == author.id));
}
