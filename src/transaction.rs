//! Transactional application of generated SQL.
//!
//! A generated batch is split into statements on [`STATEMENT_DELIMITER`],
//! then applied as a unit: begin, execute each statement, commit on full
//! success or roll back on the first failure. One begin/execute/commit
//! protocol is implemented once and parameterized over an
//! [`EngineTransaction`] adapter per engine; the adapters differ only in
//! which transaction API they invoke.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::{DatabaseDriver, DbError, DbRequest, DbResult, IsolationLevel};
use crate::engine::EngineKind;
use crate::generate::GeneratedSql;

/// Token separating statements inside a generated SQL batch.
///
/// Shared contract with the orchestration Lua module; it never occurs in
/// well-formed SQL text.
pub const STATEMENT_DELIMITER: &str = "\n--<<qry>>--\n";

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("migration {label:?} produced no executable statements")]
    EmptyBatch { label: String },

    #[error("failed to open transaction for {label:?}: {source}")]
    Begin {
        label: String,
        #[source]
        source: DbError,
    },

    #[error("statement {index} of {total} failed for {label:?}: {source}")]
    Statement {
        label: String,
        index: usize,
        total: usize,
        #[source]
        source: DbError,
    },

    #[error("commit failed for {label:?}: {source}")]
    Commit {
        label: String,
        #[source]
        source: DbError,
    },
}

/// Result of a fully committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedBatch {
    pub statements: usize,
}

/// Split a generated batch into individual statements: split on the
/// delimiter, trim surrounding whitespace, drop empties.
pub fn split_statements(text: &str) -> Vec<&str> {
    text.split(STATEMENT_DELIMITER)
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Short content hash of a statement, used as the prepared-statement cache
/// key so identical statements across runs reuse a cached plan.
pub fn statement_key(sql: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    digest[..8].iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Engine-specific transaction API. The default methods forward straight to
/// the driver; adapters override only where an engine deviates.
pub trait EngineTransaction {
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    fn begin(&self, driver: &mut dyn DatabaseDriver) -> Result<(), DbError> {
        driver.begin_transaction(self.isolation())
    }

    fn execute(
        &self,
        driver: &mut dyn DatabaseDriver,
        request: &DbRequest,
    ) -> Result<DbResult, DbError> {
        driver.execute(request)
    }

    fn commit(&self, driver: &mut dyn DatabaseDriver) -> Result<(), DbError> {
        driver.commit_transaction()
    }

    fn rollback(&self, driver: &mut dyn DatabaseDriver) -> Result<(), DbError> {
        driver.rollback_transaction()
    }

    fn cleanup(&self, driver: &mut dyn DatabaseDriver) {
        driver.cleanup_transaction();
    }
}

pub struct PostgresTransaction;
impl EngineTransaction for PostgresTransaction {}

pub struct MySqlTransaction;
impl EngineTransaction for MySqlTransaction {}

pub struct SqliteTransaction;
impl EngineTransaction for SqliteTransaction {}

pub struct Db2Transaction;
impl EngineTransaction for Db2Transaction {
    // DB2 spells read committed "cursor stability".
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::CursorStability
    }
}

/// The transaction adapter for an engine.
pub fn transaction_for(engine: EngineKind) -> &'static dyn EngineTransaction {
    match engine {
        EngineKind::PostgreSql => &PostgresTransaction,
        EngineKind::MySql => &MySqlTransaction,
        EngineKind::Sqlite => &SqliteTransaction,
        EngineKind::Db2 => &Db2Transaction,
    }
}

/// Apply one generated batch as a single transaction.
///
/// Zero statements after splitting is a failure, treated identically to "no
/// SQL generated". Never partially commits; per-transaction driver
/// resources are cleaned up regardless of outcome.
pub fn apply(
    driver: &mut dyn DatabaseDriver,
    engine: EngineKind,
    generated: &GeneratedSql,
    label: &str,
    timeout_secs: u64,
) -> Result<AppliedBatch, TransactionError> {
    let statements = split_statements(&generated.text);
    if statements.is_empty() {
        warn!(migration = label, "generated SQL contains no statements");
        return Err(TransactionError::EmptyBatch {
            label: label.to_string(),
        });
    }

    let txn = transaction_for(engine);
    let outcome = run_batch(txn, driver, &statements, label, timeout_secs);
    txn.cleanup(driver);
    outcome
}

fn run_batch(
    txn: &dyn EngineTransaction,
    driver: &mut dyn DatabaseDriver,
    statements: &[&str],
    label: &str,
    timeout_secs: u64,
) -> Result<AppliedBatch, TransactionError> {
    txn.begin(driver).map_err(|source| TransactionError::Begin {
        label: label.to_string(),
        source,
    })?;

    let total = statements.len();
    for (position, sql) in statements.iter().enumerate() {
        let index = position + 1;
        let request = DbRequest {
            sql: (*sql).to_string(),
            statement_key: statement_key(sql),
            timeout_secs,
        };
        match txn.execute(driver, &request) {
            Ok(_) => {
                debug!(
                    migration = label,
                    statement = index,
                    total,
                    key = %request.statement_key,
                    "statement executed"
                );
            }
            Err(source) => {
                error!(
                    migration = label,
                    statement = index,
                    total,
                    error = %source,
                    "statement failed, rolling back"
                );
                roll_back(txn, driver, label);
                return Err(TransactionError::Statement {
                    label: label.to_string(),
                    index,
                    total,
                    source,
                });
            }
        }
    }

    match txn.commit(driver) {
        Ok(()) => {
            info!(migration = label, statements = total, "migration committed");
            Ok(AppliedBatch { statements: total })
        }
        Err(source) => {
            roll_back(txn, driver, label);
            Err(TransactionError::Commit {
                label: label.to_string(),
                source,
            })
        }
    }
}

fn roll_back(txn: &dyn EngineTransaction, driver: &mut dyn DatabaseDriver, label: &str) {
    if let Err(error) = txn.rollback(driver) {
        error!(migration = label, error = %error, "rollback failed");
    } else {
        info!(migration = label, "migration rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDriver;

    fn generated(text: &str) -> GeneratedSql {
        GeneratedSql {
            text: text.to_string(),
            statement_count: 0,
        }
    }

    #[test]
    fn test_split_statements_trims_and_drops_empties() {
        let text = format!(
            "  CREATE TABLE a (id INT)  {STATEMENT_DELIMITER}\n\n{STATEMENT_DELIMITER}INSERT INTO a VALUES (1)\n"
        );
        let statements = split_statements(&text);
        assert_eq!(
            statements,
            vec!["CREATE TABLE a (id INT)", "INSERT INTO a VALUES (1)"]
        );
    }

    #[test]
    fn test_statement_key_is_short_stable_hex() {
        let key = statement_key("SELECT 1");
        assert_eq!(key.len(), 16);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(key, statement_key("SELECT 1"));
        assert_ne!(key, statement_key("SELECT 2"));
    }

    #[test]
    fn test_apply_commits_all_statements() {
        let mut driver = MemoryDriver::new();
        let batch = generated(&format!(
            "CREATE TABLE t (id INT){STATEMENT_DELIMITER}INSERT INTO t VALUES (1)"
        ));

        let applied = apply(&mut driver, EngineKind::PostgreSql, &batch, "t_1", 30).unwrap();
        assert_eq!(applied.statements, 2);
        assert_eq!(
            driver.committed(),
            &[
                "CREATE TABLE t (id INT)".to_string(),
                "INSERT INTO t VALUES (1)".to_string()
            ]
        );
        assert_eq!(driver.cleanup_count(), 1);
    }

    #[test]
    fn test_apply_rolls_back_on_statement_failure() {
        let mut driver = MemoryDriver::new().with_failure_on("VALUES (2)");
        let batch = generated(&format!(
            "INSERT INTO t VALUES (1){STATEMENT_DELIMITER}INSERT INTO t VALUES (2){STATEMENT_DELIMITER}INSERT INTO t VALUES (3)"
        ));

        let err = apply(&mut driver, EngineKind::MySql, &batch, "t_2", 30).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Statement {
                index: 2,
                total: 3,
                ..
            }
        ));
        // No partial effects survive the rollback.
        assert!(driver.committed().is_empty());
        assert!(!driver.in_transaction());
        assert_eq!(driver.cleanup_count(), 1);
    }

    #[test]
    fn test_apply_rejects_empty_batch() {
        let mut driver = MemoryDriver::new();
        let batch = generated(&format!("  {STATEMENT_DELIMITER} \n "));
        let err = apply(&mut driver, EngineKind::Sqlite, &batch, "t_3", 30).unwrap_err();
        assert!(matches!(err, TransactionError::EmptyBatch { .. }));
        assert_eq!(driver.begin_count(), 0);
    }

    #[test]
    fn test_db2_uses_cursor_stability() {
        assert_eq!(
            transaction_for(EngineKind::Db2).isolation(),
            IsolationLevel::CursorStability
        );
        assert_eq!(
            transaction_for(EngineKind::PostgreSql).isolation(),
            IsolationLevel::ReadCommitted
        );
    }
}
