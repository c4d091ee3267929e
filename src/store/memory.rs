//! In-Memory Store
//!
//! Deterministic store with the same locking contract as PostgreSQL:
//! - reads see committed rows plus the transaction's own writes
//! - each account row has a `tokio::sync::Mutex`; a transaction keeps the
//!   owned guard until it ends
//! - writes are staged on the transaction and applied on commit
//!
//! Fail points let tests inject a failure into any step of a transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace};

use super::{Queries, Store};
use crate::error::BankError;
use crate::models::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, Entry,
    ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer, UpdateAccountParams,
};

/// Step at which an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    CreateTransfer,
    CreateEntry,
    GetAccountForUpdate,
    UpdateAccount,
    Commit,
    Rollback,
}

type RowLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    // Sequences are not rolled back, as in PostgreSQL
    next_account_id: i64,
    next_entry_id: i64,
    next_transfer_id: i64,
}

impl Tables {
    fn next_id(seq: &mut i64) -> i64 {
        *seq += 1;
        *seq
    }
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<i64, RowLock>>,
    fail_points: Mutex<HashSet<FailPoint>>,
    lock_journal: Mutex<Vec<Vec<i64>>>,
    next_tx_id: AtomicU64,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking unit of work never holds these guards, so poisoned data is intact
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.skip(offset).take(limit).collect()
}

/// In-memory store shared by cloning
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next transaction that reaches `point` fail there
    pub fn fail_once(&self, point: FailPoint) {
        lock(&self.shared.fail_points).insert(point);
    }

    fn trip(&self, point: FailPoint) -> Result<(), BankError> {
        trip(&self.shared, point)
    }

    /// Committed accounts ordered by id
    pub fn accounts(&self) -> Vec<Account> {
        lock(&self.shared.tables).accounts.values().cloned().collect()
    }

    /// Committed entries ordered by id
    pub fn entries(&self) -> Vec<Entry> {
        lock(&self.shared.tables).entries.values().cloned().collect()
    }

    /// Committed transfers ordered by id
    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.shared.tables).transfers.values().cloned().collect()
    }

    /// Row locks in acquisition order, one list per committed transaction
    pub fn lock_journal(&self) -> Vec<Vec<i64>> {
        lock(&self.shared.lock_journal).clone()
    }

    /// True while some open transaction holds the row lock of `account_id`
    pub fn is_row_locked(&self, account_id: i64) -> bool {
        let row = lock(&self.shared.row_locks).get(&account_id).cloned();
        match row {
            Some(row) => {
                let locked = row.try_lock().is_err();
                locked
            }
            None => false,
        }
    }

    pub fn commit_count(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }
}

fn trip(shared: &Shared, point: FailPoint) -> Result<(), BankError> {
    if lock(&shared.fail_points).remove(&point) {
        debug!(fail_point = ?point, "Injected failure");
        return Err(BankError::Database(format!("injected failure at {:?}", point)));
    }
    Ok(())
}

/// Open transaction on a [`MemoryStore`]
///
/// Dropping it without commit discards the staged writes and releases every
/// row lock it holds.
pub struct MemoryTx {
    id: u64,
    shared: Arc<Shared>,
    held: HashMap<i64, OwnedMutexGuard<()>>,
    lock_order: Vec<i64>,
    accounts: BTreeMap<i64, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl MemoryTx {
    /// Account as seen by this transaction
    fn visible_account(&self, id: i64) -> Option<Account> {
        self.accounts
            .get(&id)
            .cloned()
            .or_else(|| lock(&self.shared.tables).accounts.get(&id).cloned())
    }

    fn require_account(&self, id: i64) -> Result<Account, BankError> {
        self.visible_account(id).ok_or(BankError::AccountNotFound(id))
    }

    async fn lock_row(&mut self, account_id: i64) {
        if self.held.contains_key(&account_id) {
            return;
        }

        let row = lock(&self.shared.row_locks)
            .entry(account_id)
            .or_default()
            .clone();

        trace!(tx_id = self.id, account_id, "Waiting for row lock");
        let guard = row.lock_owned().await;
        trace!(tx_id = self.id, account_id, "Row lock acquired");

        self.lock_order.push(account_id);
        self.held.insert(account_id, guard);
    }

    fn next_id(&self, pick: impl FnOnce(&mut Tables) -> &mut i64) -> i64 {
        let mut tables = lock(&self.shared.tables);
        Tables::next_id(pick(&mut tables))
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, BankError> {
        let id = self.next_id(|t| &mut t.next_account_id);
        let account = Account {
            id,
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, BankError> {
        self.require_account(id)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, BankError> {
        trip(&self.shared, FailPoint::GetAccountForUpdate)?;
        self.require_account(id)?;
        self.lock_row(id).await;
        // Re-read: the previous holder may have committed a new balance
        self.require_account(id)
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>, BankError> {
        let mut visible = lock(&self.shared.tables).accounts.clone();
        visible.extend(self.accounts.iter().map(|(id, a)| (*id, a.clone())));

        let owned = visible.into_values().filter(|a| a.owner == arg.owner);
        Ok(page(owned, arg.limit, arg.offset))
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, BankError> {
        trip(&self.shared, FailPoint::UpdateAccount)?;
        self.require_account(arg.id)?;
        self.lock_row(arg.id).await;

        let mut account = self.require_account(arg.id)?;
        account.balance = arg.balance;
        self.accounts.insert(arg.id, account.clone());
        Ok(account)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, BankError> {
        trip(&self.shared, FailPoint::CreateEntry)?;
        self.require_account(arg.account_id)?;

        let entry = Entry {
            id: self.next_id(|t| &mut t.next_entry_id),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, BankError> {
        if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
            return Ok(entry.clone());
        }
        lock(&self.shared.tables)
            .entries
            .get(&id)
            .cloned()
            .ok_or(BankError::EntryNotFound(id))
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, BankError> {
        let mut visible = lock(&self.shared.tables).entries.clone();
        visible.extend(self.entries.iter().map(|e| (e.id, e.clone())));

        let rows = visible
            .into_values()
            .filter(|e| e.account_id == arg.account_id);
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, BankError> {
        trip(&self.shared, FailPoint::CreateTransfer)?;
        self.require_account(arg.from_account_id)?;
        self.require_account(arg.to_account_id)?;

        let transfer = Transfer {
            id: self.next_id(|t| &mut t.next_transfer_id),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, BankError> {
        if let Some(transfer) = self.transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        lock(&self.shared.tables)
            .transfers
            .get(&id)
            .cloned()
            .ok_or(BankError::TransferNotFound(id))
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, BankError> {
        let mut visible = lock(&self.shared.tables).transfers.clone();
        visible.extend(self.transfers.iter().map(|t| (t.id, t.clone())));

        let rows = visible.into_values().filter(|t| {
            t.from_account_id == arg.from_account_id || t.to_account_id == arg.to_account_id
        });
        Ok(page(rows, arg.limit, arg.offset))
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<MemoryTx, BankError> {
        self.trip(FailPoint::Begin)
            .map_err(|e| BankError::Begin(e.to_string()))?;

        let id = self.shared.next_tx_id.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(tx_id = id, "Begin");
        Ok(MemoryTx {
            id,
            shared: Arc::clone(&self.shared),
            held: HashMap::new(),
            lock_order: Vec::new(),
            accounts: BTreeMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), BankError> {
        let MemoryTx {
            id,
            held,
            lock_order,
            accounts,
            entries,
            transfers,
            ..
        } = tx;

        // The staged writes are dropped with the error, like an aborted COMMIT
        self.trip(FailPoint::Commit)
            .map_err(|e| BankError::Commit(e.to_string()))?;

        {
            let mut tables = lock(&self.shared.tables);
            tables.accounts.extend(accounts);
            tables.entries.extend(entries.into_iter().map(|e| (e.id, e)));
            tables
                .transfers
                .extend(transfers.into_iter().map(|t| (t.id, t)));
        }
        lock(&self.shared.lock_journal).push(lock_order);
        self.shared.commits.fetch_add(1, Ordering::SeqCst);

        // Row locks are released only after the new balances are visible
        drop(held);
        trace!(tx_id = id, "Commit");
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), BankError> {
        let tx_id = tx.id;
        drop(tx);
        self.trip(FailPoint::Rollback)
            .map_err(|e| BankError::Database(format!("rollback: {}", e)))?;

        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        trace!(tx_id, "Rollback");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(owner: &str, balance: i64) -> CreateAccountParams {
        CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: "USD".to_string(),
        }
    }

    async fn seeded(store: &MemoryStore, balances: &[i64]) -> Vec<Account> {
        let mut tx = store.begin().await.unwrap();
        let mut accounts = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            accounts.push(
                tx.create_account(usd(&format!("owner-{}", i), *balance))
                    .await
                    .unwrap(),
            );
        }
        store.commit(tx).await.unwrap();
        accounts
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible_to_others() {
        let store = MemoryStore::new();
        let mut writer = store.begin().await.unwrap();
        let account = writer.create_account(usd("alice", 5)).await.unwrap();

        let mut reader = store.begin().await.unwrap();
        assert_eq!(
            reader.get_account(account.id).await,
            Err(BankError::AccountNotFound(account.id))
        );
        // The writer sees its own insert
        assert_eq!(writer.get_account(account.id).await.unwrap(), account);

        store.commit(writer).await.unwrap();
        assert_eq!(reader.get_account(account.id).await.unwrap(), account);
    }

    #[tokio::test]
    async fn test_drop_discards_writes_and_releases_locks() {
        let store = MemoryStore::new();
        let accounts = seeded(&store, &[100]).await;
        let id = accounts[0].id;

        {
            let mut tx = store.begin().await.unwrap();
            tx.update_account(UpdateAccountParams { id, balance: 1 })
                .await
                .unwrap();
            tx.create_entry(CreateEntryParams {
                account_id: id,
                amount: -99,
            })
            .await
            .unwrap();
            assert!(store.is_row_locked(id));
        }

        assert!(!store.is_row_locked(id));
        assert_eq!(store.accounts()[0].balance, 100);
        assert!(store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_locking_read_waits_for_holder() {
        let store = MemoryStore::new();
        let id = seeded(&store, &[100]).await[0].id;

        let mut first = store.begin().await.unwrap();
        first.get_account_for_update(id).await.unwrap();
        first
            .update_account(UpdateAccountParams { id, balance: 40 })
            .await
            .unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = waiter_store.begin().await.unwrap();
            let seen = second.get_account_for_update(id).await.unwrap();
            waiter_store.commit(second).await.unwrap();
            seen.balance
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.commit(first).await.unwrap();
        // The waiter reads the balance committed by the holder
        assert_eq!(waiter.await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_missing_account_is_not_found() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        assert_eq!(
            tx.get_account_for_update(42).await,
            Err(BankError::AccountNotFound(42))
        );
        assert_eq!(
            tx.update_account(UpdateAccountParams { id: 42, balance: 1 })
                .await,
            Err(BankError::AccountNotFound(42))
        );
        assert_eq!(
            tx.create_entry(CreateEntryParams {
                account_id: 42,
                amount: 1
            })
            .await,
            Err(BankError::AccountNotFound(42))
        );
        assert!(!store.is_row_locked(42));
    }

    #[tokio::test]
    async fn test_list_operations_page_in_id_order() {
        let store = MemoryStore::new();
        let accounts = seeded(&store, &[10, 20, 30]).await;
        let (a, b, c) = (accounts[0].id, accounts[1].id, accounts[2].id);

        let mut tx = store.begin().await.unwrap();
        for (from, to) in [(a, b), (b, c), (c, a), (a, c)] {
            tx.create_transfer(CreateTransferParams {
                from_account_id: from,
                to_account_id: to,
                amount: 1,
            })
            .await
            .unwrap();
        }
        for amount in [1, -2, 3] {
            tx.create_entry(CreateEntryParams {
                account_id: a,
                amount,
            })
            .await
            .unwrap();
        }
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let transfers = tx
            .list_transfers(ListTransfersParams {
                from_account_id: a,
                to_account_id: a,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(transfers.len(), 3);
        assert!(transfers.windows(2).all(|w| w[0].id < w[1].id));

        let entries = tx
            .list_entries(ListEntriesParams {
                account_id: a,
                limit: 2,
                offset: 1,
            })
            .await
            .unwrap();
        let amounts: Vec<i64> = entries.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![-2, 3]);

        let owned = tx
            .list_accounts(ListAccountsParams {
                owner: "owner-1".to_string(),
                limit: 5,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, b);
    }

    #[tokio::test]
    async fn test_fail_point_fires_once() {
        let store = MemoryStore::new();
        let id = seeded(&store, &[10]).await[0].id;
        store.fail_once(FailPoint::CreateEntry);

        let mut tx = store.begin().await.unwrap();
        let first = tx
            .create_entry(CreateEntryParams {
                account_id: id,
                amount: 1,
            })
            .await;
        assert!(matches!(first, Err(BankError::Database(_))));

        let second = tx
            .create_entry(CreateEntryParams {
                account_id: id,
                amount: 1,
            })
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_lock_journal_records_acquisition_order() {
        let store = MemoryStore::new();
        let accounts = seeded(&store, &[10, 10]).await;
        let (a, b) = (accounts[0].id, accounts[1].id);

        let mut tx = store.begin().await.unwrap();
        tx.get_account_for_update(b).await.unwrap();
        tx.get_account_for_update(a).await.unwrap();
        // Re-locking a held row is a no-op
        tx.update_account(UpdateAccountParams { id: b, balance: 5 })
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(store.lock_journal().last(), Some(&vec![b, a]));
    }
}
