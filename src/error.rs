//! Bank Error Types
//!
//! One error type flows out of the store, the coordinator and the transfer
//! orchestrator. Business rejections and transaction failures are kept in
//! separate variants so the upstream layer can map them to responses.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BankError {
    // === Validation Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    // === Business Rejections ===
    #[error("Insufficient balance in account: {account_id}")]
    InsufficientBalance { account_id: i64 },

    #[error("Overflow in account: {account_id}")]
    Overflow { account_id: i64 },

    #[error("Currency mismatch: {from} -> {to}")]
    CurrencyMismatch { from: String, to: String },

    // === Lookup Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("Entry not found: {0}")]
    EntryNotFound(i64),

    #[error("Transfer not found: {0}")]
    TransferNotFound(i64),

    // === Transaction Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Failed to begin transaction: {0}")]
    Begin(String),

    #[error("Failed to commit transaction: {0}")]
    Commit(String),

    /// The unit of work failed and the rollback that followed failed too.
    #[error("tx error: {cause}, rb error: {rollback}")]
    Rollback {
        #[source]
        cause: Box<BankError>,
        rollback: String,
    },

    #[error("Transaction deadline exceeded")]
    DeadlineExceeded,
}

impl BankError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            BankError::Validation(_) => "VALIDATION_ERROR",
            BankError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            BankError::Overflow { .. } => "OVERFLOW",
            BankError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            BankError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            BankError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            BankError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            BankError::Database(_) => "DATABASE_ERROR",
            BankError::Begin(_) => "TX_BEGIN_FAILED",
            BankError::Commit(_) => "TX_COMMIT_FAILED",
            BankError::Rollback { .. } => "TX_ROLLBACK_FAILED",
            BankError::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            BankError::Validation(_) => 400,
            BankError::AccountNotFound(_)
            | BankError::EntryNotFound(_)
            | BankError::TransferNotFound(_) => 404,
            BankError::InsufficientBalance { .. }
            | BankError::Overflow { .. }
            | BankError::CurrencyMismatch { .. } => 422,
            BankError::Database(_)
            | BankError::Begin(_)
            | BankError::Commit(_)
            | BankError::Rollback { .. } => 500,
            BankError::DeadlineExceeded => 503,
        }
    }

    /// True for failures of the underlying store rather than of the request.
    pub fn is_transaction_error(&self) -> bool {
        matches!(
            self,
            BankError::Database(_)
                | BankError::Begin(_)
                | BankError::Commit(_)
                | BankError::Rollback { .. }
                | BankError::DeadlineExceeded
        )
    }

    /// The error that triggered a failed rollback, or `self` otherwise.
    pub fn root_cause(&self) -> &BankError {
        match self {
            BankError::Rollback { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<sqlx::Error> for BankError {
    fn from(e: sqlx::Error) -> Self {
        BankError::Database(e.to_string())
    }
}

impl From<validator::ValidationErrors> for BankError {
    fn from(e: validator::ValidationErrors) -> Self {
        BankError::Validation(e.to_string())
    }
}
