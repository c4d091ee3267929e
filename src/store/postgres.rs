//! PostgreSQL Store
//!
//! Every query of a [`PgQueries`] runs on the `sqlx` transaction it wraps.
//! Locking reads use `FOR NO KEY UPDATE`: exclusive against other writers of
//! the row, but compatible with the `KEY SHARE` locks that foreign-key checks
//! take when entries and transfers referencing the account are inserted.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::{Queries, Store};
use crate::error::BankError;
use crate::models::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer, UpdateAccountParams,
};

/// SQLSTATE foreign_key_violation
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Store backed by a PostgreSQL connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Repository handle bound to one open PostgreSQL transaction
pub struct PgQueries {
    tx: Transaction<'static, Postgres>,
}

/// Name of the violated foreign-key constraint, if `err` is one
fn violated_foreign_key(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgQueries;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<PgQueries, BankError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BankError::Begin(e.to_string()))?;
        Ok(PgQueries { tx })
    }

    async fn commit(&self, tx: PgQueries) -> Result<(), BankError> {
        tx.tx
            .commit()
            .await
            .map_err(|e| BankError::Commit(e.to_string()))
    }

    async fn rollback(&self, tx: PgQueries) -> Result<(), BankError> {
        tx.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Queries for PgQueries {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, BankError> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, $2, $3)
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(&arg.owner)
        .bind(arg.balance)
        .bind(&arg.currency)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, BankError> {
        sqlx::query_as::<_, Account>(
            r#"
            SELECT id, owner, balance, currency, created_at FROM accounts
            WHERE id = $1 LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(BankError::AccountNotFound(id))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, BankError> {
        debug!(account_id = id, "Locking account row");
        sqlx::query_as::<_, Account>(
            r#"
            SELECT id, owner, balance, currency, created_at FROM accounts
            WHERE id = $1 LIMIT 1
            FOR NO KEY UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(BankError::AccountNotFound(id))
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>, BankError> {
        let rows = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, owner, balance, currency, created_at FROM accounts
            WHERE owner = $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&arg.owner)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows)
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, BankError> {
        sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts SET balance = $2
            WHERE id = $1
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(arg.id)
        .bind(arg.balance)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(BankError::AccountNotFound(arg.id))
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, BankError> {
        sqlx::query_as::<_, Entry>(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(arg.account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match violated_foreign_key(&e) {
            Some(_) => BankError::AccountNotFound(arg.account_id),
            None => e.into(),
        })
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, BankError> {
        sqlx::query_as::<_, Entry>(
            "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(BankError::EntryNotFound(id))
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, BankError> {
        let rows = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, account_id, amount, created_at FROM entries
            WHERE account_id = $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(arg.account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, BankError> {
        sqlx::query_as::<_, Transfer>(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match violated_foreign_key(&e) {
            Some(constraint) if constraint.contains("to_account") => {
                BankError::AccountNotFound(arg.to_account_id)
            }
            Some(_) => BankError::AccountNotFound(arg.from_account_id),
            None => e.into(),
        })
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, BankError> {
        sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers
            WHERE id = $1 LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(BankError::TransferNotFound(id))
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, BankError> {
        let rows = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers
            WHERE from_account_id = $1 OR to_account_id = $2
            ORDER BY id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows)
    }
}
