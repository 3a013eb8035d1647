//! Credit transfers between user accounts.

use std::time::{Duration, Instant};

use common::UserId;
use persistence::{
    Adjustment, Counter, Scope, Store, StoreError, Table, User, with_deadline, with_transaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// Result of a committed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub from: UserId,
    pub to: UserId,
    pub amount: i64,
    /// Source balance after the transfer.
    pub from_balance: i64,
    /// Destination balance after the transfer.
    pub to_balance: i64,
}

/// Moves credits between two accounts atomically.
///
/// Both account rows are locked for the length of the transaction, always
/// lowest id first, so transfers in opposite directions between the same
/// pair queue up instead of deadlocking.
#[derive(Clone)]
pub struct CreditTransfer<S: Store> {
    store: S,
    timeout: Option<Duration>,
}

impl<S: Store> CreditTransfer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    /// Bounds each transfer by `timeout`. On expiry the transaction is
    /// rolled back and the call fails with `StoreError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Moves `amount` credits from `from` to `to`.
    ///
    /// Either both balances change or neither does.
    #[tracing::instrument(skip(self))]
    pub async fn transfer_credits(
        &self,
        from: UserId,
        to: UserId,
        amount: i64,
    ) -> Result<TransferReceipt> {
        if amount <= 0 {
            return Err(WorkflowError::InvalidAmount(amount));
        }
        if from == to {
            return Err(WorkflowError::SameAccount(from));
        }

        let started = Instant::now();
        let result = with_deadline(
            self.timeout,
            with_transaction(&self.store, |scope| {
                Box::pin(async move {
                    let (source, destination) = lock_pair(scope, from, to).await?;
                    if source.credits < amount {
                        return Err(WorkflowError::InsufficientCredits {
                            available: source.credits,
                            requested: amount,
                        });
                    }

                    let debit = Adjustment::decrement(Counter::UserCredits, from, amount);
                    if scope.adjust(debit).await? == 0 {
                        return Err(WorkflowError::InsufficientCredits {
                            available: source.credits,
                            requested: amount,
                        });
                    }
                    let credit = Adjustment::increment(Counter::UserCredits, to, amount);
                    if scope.adjust(credit).await? == 0 {
                        return Err(StoreError::not_found(Table::Users, to).into());
                    }

                    Ok(TransferReceipt {
                        from,
                        to,
                        amount,
                        from_balance: source.credits - amount,
                        to_balance: destination.credits + amount,
                    })
                })
            }),
        )
        .await;

        metrics::histogram!("workflow_duration_seconds", "workflow" => "transfer_credits")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(receipt) => {
                metrics::counter!("credit_transfers_total", "outcome" => "completed").increment(1);
                tracing::info!(
                    %from,
                    %to,
                    amount,
                    from_balance = receipt.from_balance,
                    to_balance = receipt.to_balance,
                    "credits transferred"
                );
                Ok(receipt)
            }
            Err(err) => {
                metrics::counter!("credit_transfers_total", "outcome" => "failed").increment(1);
                tracing::warn!(%from, %to, amount, error = %err, "credit transfer failed");
                Err(err)
            }
        }
    }
}

/// Locks both accounts in ascending id order and returns them as
/// `(from, to)`.
async fn lock_pair<Sc: Scope>(scope: &mut Sc, from: UserId, to: UserId) -> Result<(User, User)> {
    let (first, second) = if from < to { (from, to) } else { (to, from) };
    let first = scope.lock_for_update::<User>(first.as_i64()).await?;
    let second = scope.lock_for_update::<User>(second.as_i64()).await?;

    if first.id == from {
        Ok((first, second))
    } else {
        Ok((second, first))
    }
}
