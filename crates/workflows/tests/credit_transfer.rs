//! Integration tests for credit transfers over the in-memory store.

use common::UserId;
use persistence::{InMemoryStore, NewUser, StoreError, Table, User, UserRepository};
use workflows::{CreditTransfer, ErrorKind, WorkflowError};

struct TestHarness {
    store: InMemoryStore,
    transfer: CreditTransfer<InMemoryStore>,
}

impl TestHarness {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let transfer = CreditTransfer::new(store.clone());
        Self { store, transfer }
    }

    async fn account(&self, name: &str, credits: i64) -> UserId {
        self.store
            .users()
            .create(NewUser::new(format!("{name}@example.com"), name).with_credits(credits))
            .await
            .unwrap()
            .id
    }

    async fn balance(&self, id: UserId) -> i64 {
        self.store
            .snapshot()
            .await
            .get::<User>(id.as_i64())
            .unwrap()
            .credits
    }
}

#[tokio::test]
async fn transfer_moves_credits() {
    let h = TestHarness::new();
    let a = h.account("a", 100).await;
    let b = h.account("b", 10).await;

    let receipt = h.transfer.transfer_credits(a, b, 50).await.unwrap();

    assert_eq!(receipt.from_balance, 50);
    assert_eq!(receipt.to_balance, 60);
    assert_eq!(h.balance(a).await, 50);
    assert_eq!(h.balance(b).await, 60);
}

#[tokio::test]
async fn overdraft_leaves_balances_unchanged() {
    let h = TestHarness::new();
    let a = h.account("a", 100).await;
    let b = h.account("b", 10).await;

    let err = h.transfer.transfer_credits(a, b, 200).await.unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::InsufficientCredits {
            available: 100,
            requested: 200
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.balance(a).await, 100);
    assert_eq!(h.balance(b).await, 10);
}

#[tokio::test]
async fn retry_after_funding_matches_single_transfer() {
    let h = TestHarness::new();
    let a = h.account("a", 30).await;
    let b = h.account("b", 0).await;
    let funder = h.account("funder", 100).await;

    assert!(h.transfer.transfer_credits(a, b, 50).await.is_err());
    h.transfer.transfer_credits(funder, a, 20).await.unwrap();
    h.transfer.transfer_credits(a, b, 50).await.unwrap();

    assert_eq!(h.balance(a).await, 0);
    assert_eq!(h.balance(b).await, 50);
    assert_eq!(h.balance(funder).await, 80);
}

#[tokio::test]
async fn missing_account_is_not_found() {
    let h = TestHarness::new();
    let a = h.account("a", 100).await;

    let err = h
        .transfer
        .transfer_credits(a, UserId::new(404), 10)
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::NotFound { id: 404, .. }));
    assert_eq!(h.balance(a).await, 100);
}

#[tokio::test]
async fn soft_deleted_account_is_not_found() {
    let h = TestHarness::new();
    let a = h.account("a", 100).await;
    let b = h.account("b", 0).await;
    h.store.users().delete(b).await.unwrap();

    let err = h.transfer.transfer_credits(a, b, 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.balance(a).await, 100);
}

#[tokio::test]
async fn opposite_transfers_complete_and_conserve_credits() {
    let h = TestHarness::new();
    let a = h.account("a", 500).await;
    let b = h.account("b", 500).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let transfer = h.transfer.clone();
        let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
        handles.push(tokio::spawn(async move {
            transfer.transfer_credits(from, to, 10).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.balance(a).await + h.balance(b).await, 1000);
    assert_eq!(h.balance(a).await, 500);
}

#[tokio::test]
async fn credit_past_bigint_fails_and_rolls_back() {
    let h = TestHarness::new();
    let a = h.account("a", 100).await;
    let full = h.account("full", i64::MAX).await;

    let err = h.transfer.transfer_credits(a, full, 50).await.unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::Store(StoreError::OutOfRange {
            table: Table::Users,
            column: "credits"
        })
    ));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(h.balance(a).await, 100);
    assert_eq!(h.balance(full).await, i64::MAX);
}
