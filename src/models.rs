//! Persisted records and operation parameters
//!
//! `Account` rows carry the balance. `Entry` and `Transfer` rows are
//! append-only: they are inserted once and never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::{Validate, ValidationError};

use crate::currency::validate_currency;

/// Largest page accepted by the list operations
pub const MAX_PAGE_SIZE: i64 = 100;

// ============================================================================
// Records
// ============================================================================

/// Balance-holding account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    /// Minor units, never negative once committed
    pub balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Ledger line recording a signed balance change of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    /// Negative for debits, positive for credits
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of money moved from one account to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Everything written by one successful transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    /// The account that the money was transferred from
    pub from_account: Account,
    /// The account that the money was transferred to
    pub to_account: Account,
    /// Debit entry on the source account
    pub from_entry: Entry,
    /// Credit entry on the destination account
    pub to_entry: Entry,
}

// ============================================================================
// Engine input
// ============================================================================

/// Input of a transfer transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_distinct_accounts"))]
pub struct TransferTxParams {
    #[validate(range(min = 1))]
    pub from_account_id: i64,
    #[validate(range(min = 1))]
    pub to_account_id: i64,
    #[validate(range(min = 1))]
    pub amount: i64,
}

impl TransferTxParams {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }
}

fn validate_distinct_accounts(params: &TransferTxParams) -> Result<(), ValidationError> {
    if params.from_account_id == params.to_account_id {
        return Err(ValidationError::new("same_account"));
    }
    Ok(())
}

// ============================================================================
// Repository parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CreateAccountParams {
    #[validate(length(min = 1, max = 64))]
    pub owner: String,
    #[validate(range(min = 0))]
    pub balance: i64,
    #[validate(custom(function = "validate_currency"))]
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAccountParams {
    pub id: i64,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ListAccountsParams {
    pub owner: String,
    #[validate(range(min = 1, max = 100))]
    pub limit: i64,
    #[validate(range(min = 0))]
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ListEntriesParams {
    pub account_id: i64,
    #[validate(range(min = 1, max = 100))]
    pub limit: i64,
    #[validate(range(min = 0))]
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Transfers leaving `from_account_id` or arriving at `to_account_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ListTransfersParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    #[validate(range(min = 1, max = 100))]
    pub limit: i64,
    #[validate(range(min = 0))]
    pub offset: i64,
}
