//! Store Abstraction
//!
//! Repositories and the transaction coordinator.
//!
//! # Architecture
//!
//! ```text
//! TransferService ──▶ run_in_transaction ──▶ Store::begin
//!                          │                     │
//!                          ▼                     ▼
//!                    work(&mut Tx) ───────▶ Queries (bound to Tx)
//!                          │
//!                 Ok ──▶ Store::commit
//!                 Err ─▶ Store::rollback
//! ```
//!
//! Two stores implement the same contract:
//! - [`PgStore`] - PostgreSQL through `sqlx`, row locks via `FOR NO KEY UPDATE`
//! - [`MemoryStore`] - in-process tables with per-account `tokio` mutexes as row locks
//!
//! # Safety Invariants
//!
//! 1. **One Outcome**: every transaction ends in exactly one commit or one rollback
//! 2. **Drop Is Rollback**: a transaction handle dropped without commit (panic,
//!    cancelled future) discards its writes and releases its row locks
//! 3. **Locks Live With The Tx**: a row lock taken by `get_account_for_update`
//!    or `update_account` is held until the transaction ends

pub mod memory;
pub mod postgres;

pub use memory::{FailPoint, MemoryStore, MemoryTx};
pub use postgres::{PgQueries, PgStore};

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::error::BankError;
use crate::models::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer, UpdateAccountParams,
};

/// Repository operations bound to one open transaction
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, BankError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, BankError>;

    /// Read an account and hold an exclusive lock on its row until the
    /// transaction ends. Blocks while another transaction holds the lock.
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, BankError>;

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>, BankError>;

    /// Set the balance of an account. Takes the row lock if not already held.
    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, BankError>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, BankError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, BankError>;

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, BankError>;

    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, BankError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, BankError>;

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, BankError>;
}

/// Backing store able to open atomic transactions
#[async_trait]
pub trait Store: Send + Sync {
    /// Transaction-scoped repository handle
    type Tx: Queries + Send + 'static;

    /// Get store name for logging
    fn name(&self) -> &'static str;

    async fn begin(&self) -> Result<Self::Tx, BankError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), BankError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), BankError>;
}

/// Run `work` inside one transaction of `store`.
///
/// `work` is invoked exactly once. Its success commits the transaction; its
/// failure (including an expired `deadline`) rolls it back. When the rollback
/// fails as well, both errors are returned in [`BankError::Rollback`].
pub async fn run_in_transaction<S, T, F>(
    store: &S,
    deadline: Option<Duration>,
    work: F,
) -> Result<T, BankError>
where
    S: Store + ?Sized,
    T: Send,
    F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, BankError>> + Send,
{
    let mut tx = store.begin().await?;

    let outcome = match deadline {
        Some(limit) => match tokio::time::timeout(limit, work(&mut tx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(store = store.name(), limit_ms = limit.as_millis() as u64, "Transaction deadline exceeded");
                Err(BankError::DeadlineExceeded)
            }
        },
        None => work(&mut tx).await,
    };

    match outcome {
        Ok(value) => {
            if let Err(e) = store.commit(tx).await {
                error!(store = store.name(), error = %e, "Failed to commit transaction");
                return Err(e);
            }
            Ok(value)
        }
        Err(err) => match store.rollback(tx).await {
            Ok(()) => {
                debug!(store = store.name(), error = %err, "Transaction rolled back");
                Err(err)
            }
            Err(rb_err) => {
                error!(store = store.name(), error = %err, rollback_error = %rb_err, "Rollback failed");
                Err(BankError::Rollback {
                    cause: Box::new(err),
                    rollback: rb_err.to_string(),
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateAccountParams;

    fn account_params(owner: &str, balance: i64) -> CreateAccountParams {
        CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: "USD".to_string(),
        }
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let store = MemoryStore::new();

        let account = run_in_transaction(&store, None, |q| {
            Box::pin(async move { q.create_account(account_params("alice", 10)).await })
        })
        .await
        .unwrap();

        assert_eq!(store.accounts(), vec![account]);
        assert_eq!(store.commit_count(), 1);
        assert_eq!(store.rollback_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_on_work_error() {
        let store = MemoryStore::new();

        let result: Result<(), _> = run_in_transaction(&store, None, |q| {
            Box::pin(async move {
                q.create_account(account_params("alice", 10)).await?;
                Err(BankError::Validation("abort".to_string()))
            })
        })
        .await;

        assert_eq!(result, Err(BankError::Validation("abort".to_string())));
        assert!(store.accounts().is_empty());
        assert_eq!(store.commit_count(), 0);
        assert_eq!(store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_both_errors() {
        let store = MemoryStore::new();
        store.fail_once(FailPoint::Rollback);

        let result: Result<(), _> = run_in_transaction(&store, None, |q| {
            Box::pin(async move {
                q.create_account(account_params("alice", 10)).await?;
                Err(BankError::InsufficientBalance { account_id: 1 })
            })
        })
        .await;

        match result {
            Err(BankError::Rollback { cause, rollback }) => {
                assert_eq!(*cause, BankError::InsufficientBalance { account_id: 1 });
                assert!(rollback.contains("rollback"));
            }
            other => panic!("expected rollback error, got {:?}", other),
        }
        assert!(store.accounts().is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_is_its_own_error() {
        let store = MemoryStore::new();
        store.fail_once(FailPoint::Commit);

        let result = run_in_transaction(&store, None, |q| {
            Box::pin(async move { q.create_account(account_params("alice", 10)).await })
        })
        .await;

        assert!(matches!(result, Err(BankError::Commit(_))));
        assert!(store.accounts().is_empty());
        assert_eq!(store.rollback_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_failure_never_runs_work() {
        let store = MemoryStore::new();
        store.fail_once(FailPoint::Begin);

        let mut ran = false;
        let result = run_in_transaction(&store, None, |q| {
            ran = true;
            Box::pin(async move { q.create_account(account_params("alice", 10)).await })
        })
        .await;

        assert!(matches!(result, Err(BankError::Begin(_))));
        assert!(!ran);
        assert_eq!(store.commit_count() + store.rollback_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_rolls_back_blocked_work() {
        let store = MemoryStore::new();
        let account = run_in_transaction(&store, None, |q| {
            Box::pin(async move { q.create_account(account_params("alice", 10)).await })
        })
        .await
        .unwrap();

        // Hold the row lock from another transaction
        let mut holder = store.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let id = account.id;
        let result = run_in_transaction(&store, Some(Duration::from_millis(50)), move |q| {
            Box::pin(async move {
                q.update_account(UpdateAccountParams { id, balance: 0 }).await
            })
        })
        .await;

        assert_eq!(result, Err(BankError::DeadlineExceeded));
        assert_eq!(store.rollback_count(), 1);

        store.rollback(holder).await.unwrap();
        assert!(!store.is_row_locked(id));
        assert_eq!(store.accounts()[0].balance, 10);
    }

    #[tokio::test]
    async fn test_panic_in_work_releases_row_locks() {
        let store = MemoryStore::new();
        let account = run_in_transaction(&store, None, |q| {
            Box::pin(async move { q.create_account(account_params("alice", 10)).await })
        })
        .await
        .unwrap();
        let id = account.id;

        let task_store = store.clone();
        let joined = tokio::spawn(async move {
            let _: Result<(), BankError> = run_in_transaction(&task_store, None, move |q| {
                Box::pin(async move {
                    q.update_account(UpdateAccountParams { id, balance: 0 }).await?;
                    panic!("work blew up while holding the row lock");
                })
            })
            .await;
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!store.is_row_locked(id));
        assert_eq!(store.accounts()[0].balance, 10);
        assert_eq!(store.commit_count(), 1);
    }
}
