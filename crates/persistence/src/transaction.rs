//! Closure-style transaction helpers.
//!
//! ```ignore
//! let order = with_transaction(&store, |scope| {
//!     Box::pin(async move {
//!         let order = scope.insert(NewOrder::for_user(user_id)).await?;
//!         let added = nested(scope, |sp| {
//!             Box::pin(async move { sp.adjust(decrement).await })
//!         })
//!         .await;
//!         Ok::<_, StoreError>(order)
//!     })
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::{Scope, Store, StoreError};

/// Runs `f` inside a new transaction.
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`. If the
/// returned future is dropped before it completes, the open transaction is
/// dropped with it and rolled back.
pub async fn with_transaction<S, T, E, F>(store: &S, f: F) -> Result<T, E>
where
    S: Store,
    E: From<StoreError>,
    F: for<'s> FnOnce(&'s mut S::Scope) -> BoxFuture<'s, Result<T, E>>,
{
    let mut scope = store.begin().await?;
    match f(&mut scope).await {
        Ok(value) => {
            scope.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = scope.rollback().await {
                tracing::warn!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Runs `f` inside a savepoint of an open transaction.
///
/// On `Err` only the work done inside `f` is undone and `scope` remains
/// usable; the error is handed back to the caller to recover from.
pub async fn nested<Sc, T, E, F>(scope: &mut Sc, f: F) -> Result<T, E>
where
    Sc: Scope,
    E: From<StoreError>,
    F: for<'s> FnOnce(&'s mut Sc) -> BoxFuture<'s, Result<T, E>>,
{
    let savepoint = scope.savepoint().await?;
    match f(scope).await {
        Ok(value) => {
            scope.release(savepoint).await?;
            Ok(value)
        }
        Err(err) => {
            scope.rollback_to(savepoint).await?;
            Err(err)
        }
    }
}

/// Bounds `operation` by `timeout`, when one is given.
///
/// On expiry the operation's future is dropped, which rolls back any
/// transaction it holds, and `StoreError::Timeout` is returned.
pub async fn with_deadline<T, E, Fut>(timeout: Option<Duration>, operation: Fut) -> Result<T, E>
where
    E: From<StoreError>,
    Fut: Future<Output = Result<T, E>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit).into()),
        },
        None => operation.await,
    }
}
