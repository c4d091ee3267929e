//! Transfer Orchestrator
//!
//! Moves money between two accounts in a single transaction:
//!
//! ```text
//! validate ─▶ BEGIN
//!              ├─ INSERT transfer (from, to, amount)
//!              ├─ INSERT entry (from, -amount)
//!              ├─ INSERT entry (to,   +amount)
//!              ├─ SELECT ... FOR NO KEY UPDATE   (lower id first)
//!              ├─ check balances
//!              └─ UPDATE balances                (lower id first)
//!            COMMIT / ROLLBACK
//! ```
//!
//! # Lock Ordering
//!
//! Both row locks are always taken lower account id first, whatever the
//! direction of the transfer. Two transfers A→B and B→A therefore queue on the
//! same first lock instead of each holding one lock and waiting for the other.
//!
//! # Idempotency
//!
//! None. Calling `transfer` twice with the same parameters moves the money
//! twice; deduplication belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::error::BankError;
use crate::models::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer, TransferResult,
    TransferTxParams, UpdateAccountParams,
};
use crate::store::{Queries, Store, run_in_transaction};

/// Transfer engine over a [`Store`]
pub struct TransferService<S: Store> {
    store: Arc<S>,
    tx_timeout: Option<Duration>,
}

impl<S: Store> Clone for TransferService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tx_timeout: self.tx_timeout,
        }
    }
}

impl<S: Store> TransferService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            tx_timeout: None,
        }
    }

    /// Abort (and roll back) any transaction of this service still running after `timeout`
    pub fn with_tx_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `work` in one transaction with this service's deadline
    pub async fn exec_tx<T, F>(&self, work: F) -> Result<T, BankError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, BankError>> + Send,
    {
        run_in_transaction(self.store.as_ref(), self.tx_timeout, work).await
    }

    /// Perform a money transfer from one account to the other.
    ///
    /// Creates the transfer record and both entries, then updates both
    /// balances. Rolls everything back if the source cannot cover `amount`.
    pub async fn transfer(&self, params: TransferTxParams) -> Result<TransferResult, BankError> {
        params.validate()?;

        debug!(
            from_account_id = params.from_account_id,
            to_account_id = params.to_account_id,
            amount = params.amount,
            "Transfer requested"
        );

        let result = self
            .exec_tx(move |q| Box::pin(async move { transfer_tx(q, params).await }))
            .await;

        match &result {
            Ok(r) => info!(
                transfer_id = r.transfer.id,
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                from_balance = r.from_account.balance,
                to_balance = r.to_account.balance,
                "Transfer committed"
            ),
            Err(e) => warn!(
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                code = e.code(),
                error = %e,
                "Transfer rejected"
            ),
        }

        result
    }

    /// Open an account. A non-zero opening balance is booked as an entry in
    /// the same transaction so the ledger always sums to the balance.
    pub async fn create_account(&self, params: CreateAccountParams) -> Result<Account, BankError> {
        params.validate()?;

        let account = self
            .exec_tx(move |q| {
                Box::pin(async move {
                    let opening = params.balance;
                    let account = q.create_account(params).await?;
                    if opening != 0 {
                        q.create_entry(CreateEntryParams {
                            account_id: account.id,
                            amount: opening,
                        })
                        .await?;
                    }
                    Ok(account)
                })
            })
            .await?;

        info!(
            account_id = account.id,
            owner = %account.owner,
            currency = %account.currency,
            balance = account.balance,
            "Account created"
        );
        Ok(account)
    }

    pub async fn get_account(&self, id: i64) -> Result<Account, BankError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_account(id).await }))
            .await
    }

    pub async fn list_accounts(&self, params: ListAccountsParams) -> Result<Vec<Account>, BankError> {
        params.validate()?;
        self.exec_tx(move |q| Box::pin(async move { q.list_accounts(params).await }))
            .await
    }

    pub async fn get_entry(&self, id: i64) -> Result<Entry, BankError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_entry(id).await }))
            .await
    }

    pub async fn list_entries(&self, params: ListEntriesParams) -> Result<Vec<Entry>, BankError> {
        params.validate()?;
        self.exec_tx(move |q| Box::pin(async move { q.list_entries(params).await }))
            .await
    }

    pub async fn get_transfer(&self, id: i64) -> Result<Transfer, BankError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_transfer(id).await }))
            .await
    }

    pub async fn list_transfers(
        &self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, BankError> {
        params.validate()?;
        self.exec_tx(move |q| Box::pin(async move { q.list_transfers(params).await }))
            .await
    }
}

/// The unit of work of one transfer. Must run inside a transaction.
async fn transfer_tx<Q>(q: &mut Q, arg: TransferTxParams) -> Result<TransferResult, BankError>
where
    Q: Queries + ?Sized,
{
    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
        let from = q.get_account_for_update(arg.from_account_id).await?;
        let to = q.get_account_for_update(arg.to_account_id).await?;
        (from, to)
    } else {
        let to = q.get_account_for_update(arg.to_account_id).await?;
        let from = q.get_account_for_update(arg.from_account_id).await?;
        (from, to)
    };

    if from_account.currency != to_account.currency {
        return Err(BankError::CurrencyMismatch {
            from: from_account.currency,
            to: to_account.currency,
        });
    }

    let new_from_balance = from_account.balance - arg.amount;
    if new_from_balance < 0 {
        return Err(BankError::InsufficientBalance {
            account_id: arg.from_account_id,
        });
    }

    let new_to_balance = match to_account.balance.checked_add(arg.amount) {
        Some(balance) if balance >= 0 => balance,
        _ => {
            return Err(BankError::Overflow {
                account_id: arg.to_account_id,
            });
        }
    };

    let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
        let (from, to) = add_money(
            q,
            arg.from_account_id,
            new_from_balance,
            arg.to_account_id,
            new_to_balance,
        )
        .await?;
        (from, to)
    } else {
        let (to, from) = add_money(
            q,
            arg.to_account_id,
            new_to_balance,
            arg.from_account_id,
            new_from_balance,
        )
        .await?;
        (from, to)
    };

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Write two balances, `account_id1` first
async fn add_money<Q>(
    q: &mut Q,
    account_id1: i64,
    balance1: i64,
    account_id2: i64,
    balance2: i64,
) -> Result<(Account, Account), BankError>
where
    Q: Queries + ?Sized,
{
    let account1 = q
        .update_account(UpdateAccountParams {
            id: account_id1,
            balance: balance1,
        })
        .await?;

    let account2 = q
        .update_account(UpdateAccountParams {
            id: account_id2,
            balance: balance2,
        })
        .await?;

    Ok((account1, account2))
}
