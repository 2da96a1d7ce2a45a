//! Database driver interface.
//!
//! The engine never speaks a wire protocol itself. It consumes a narrow
//! connection API: execute a request, and begin/commit/rollback/cleanup a
//! transaction. Real driver implementations live with the embedding
//! application; [`memory::MemoryDriver`] backs the test suites.

use serde_json::Value;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryDriver;

/// Transaction isolation requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    /// DB2's equivalent of read committed.
    CursorStability,
}

/// One statement execution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRequest {
    pub sql: String,

    /// Content hash of `sql`, usable as a prepared-statement cache key so
    /// identical statements across runs reuse a cached plan.
    pub statement_key: String,

    /// Timeout enforced by the driver, not by this crate.
    pub timeout_secs: u64,
}

/// Tabular result of a request: one JSON object per row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbResult {
    pub rows: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("statement failed: {0}")]
    Statement(String),

    #[error("transaction control failed: {0}")]
    Transaction(String),

    #[error("connection lost: {0}")]
    Connection(String),
}

/// The consumed database connection API.
pub trait DatabaseDriver: Send {
    fn execute(&mut self, request: &DbRequest) -> Result<DbResult, DbError>;

    fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<(), DbError>;

    fn commit_transaction(&mut self) -> Result<(), DbError>;

    fn rollback_transaction(&mut self) -> Result<(), DbError>;

    /// Release per-transaction driver resources. Safe to call whether or
    /// not a transaction is open, and must never fail.
    fn cleanup_transaction(&mut self);
}
