//! simple_bank - Atomic Money Transfers
//!
//! Moves money between accounts so that every transfer either fully applies
//! or leaves no trace, under any amount of concurrency.
//!
//! # Modules
//!
//! - [`models`] - Account, Entry and Transfer records and operation parameters
//! - [`store`] - Repository traits, the transaction coordinator, PostgreSQL and in-memory stores
//! - [`transfer`] - Transfer orchestration with deadlock-free lock ordering
//! - [`error`] - Typed errors
//! - [`currency`] - Supported currencies
//! - [`db`] - PostgreSQL pool and schema
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing setup

pub mod config;
pub mod currency;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod store;
pub mod transfer;

// Convenient re-exports at crate root
pub use error::BankError;
pub use models::{Account, Entry, Transfer, TransferResult, TransferTxParams};
pub use store::{MemoryStore, PgStore, Queries, Store, run_in_transaction};
pub use transfer::TransferService;
