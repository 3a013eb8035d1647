use common::{Money, ProductId, UserId};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use persistence::{
    InMemoryStore, NewOrder, NewProduct, NewUser, StoreError, UserRepository, with_transaction,
};
use workflows::{CreditTransfer, ItemRequest, OrderWorkflow};

/// Seeds a buyer and `count` products with effectively unlimited stock.
async fn seed(store: &InMemoryStore, count: usize) -> (UserId, Vec<ProductId>) {
    with_transaction(store, |scope| {
        Box::pin(async move {
            let buyer = scope
                .insert(NewUser::new("buyer@example.com", "buyer"))
                .await?;
            let mut ids = Vec::with_capacity(count);
            for i in 0..count {
                let product = scope
                    .insert(NewProduct::new(
                        format!("Product {i}"),
                        Money::from_cents(100 + i as i64),
                        i64::MAX / 2,
                    ))
                    .await?;
                ids.push(product.id);
            }
            Ok::<_, StoreError>((buyer.id, ids))
        })
    })
    .await
    .unwrap()
}

/// A fresh store per iteration keeps the in-memory snapshots small.
fn setup(
    rt: &tokio::runtime::Runtime,
    products: usize,
) -> (OrderWorkflow<InMemoryStore>, UserId, Vec<ProductId>) {
    let store = InMemoryStore::new();
    let (buyer, ids) = rt.block_on(seed(&store, products));
    (OrderWorkflow::new(store), buyer, ids)
}

fn bench_create_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("workflows/create_order_5_items", |b| {
        b.iter_batched(
            || setup(&rt, 5),
            |(workflow, buyer, products)| {
                rt.block_on(async {
                    let items = products.iter().map(|id| ItemRequest::new(*id, 1)).collect();
                    workflow
                        .create_order_with_items(NewOrder::for_user(buyer), items)
                        .await
                        .unwrap();
                });
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_partial_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("workflows/create_order_with_rejections", |b| {
        b.iter_batched(
            || setup(&rt, 3),
            |(workflow, buyer, products)| {
                rt.block_on(async {
                    let items = vec![
                        ItemRequest::new(products[0], 1),
                        ItemRequest::new(ProductId::new(-1), 1),
                        ItemRequest::new(products[1], 0),
                        ItemRequest::new(products[2], 1),
                    ];
                    workflow
                        .create_order_with_items(NewOrder::for_user(buyer), items)
                        .await
                        .unwrap();
                });
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_transfer(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let (a, b) = rt.block_on(async {
        let users = store.users();
        let a = users
            .create(NewUser::new("a@example.com", "a").with_credits(i64::MAX / 2))
            .await
            .unwrap();
        let b = users
            .create(NewUser::new("b@example.com", "b"))
            .await
            .unwrap();
        (a.id, b.id)
    });
    let transfer = CreditTransfer::new(store);

    c.bench_function("workflows/transfer_credits", |bench| {
        bench.iter(|| {
            rt.block_on(async {
                transfer.transfer_credits(a, b, 1).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create_order,
    bench_partial_order,
    bench_transfer
);
criterion_main!(benches);
