//! In-memory database driver.
//!
//! Records executed statements with real commit/rollback semantics: a
//! statement becomes visible in `committed()` only after a successful
//! commit, and a rollback leaves committed state untouched. Queries outside
//! a transaction are answered from canned results keyed by SQL text.
//! Failures are injectable by SQL fragment.

use std::collections::HashMap;

use serde_json::Value;

use super::{DatabaseDriver, DbError, DbRequest, DbResult, IsolationLevel};

#[derive(Debug, Default)]
pub struct MemoryDriver {
    committed: Vec<String>,
    open: Option<Vec<String>>,
    canned: HashMap<String, Vec<Value>>,
    fail_on: Option<String>,
    begin_count: usize,
    cleanup_count: usize,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` (exact match, outside a transaction) with `rows`.
    pub fn with_result(mut self, sql: impl Into<String>, rows: Vec<Value>) -> Self {
        self.canned.insert(sql.into(), rows);
        self
    }

    /// Fail any statement whose SQL contains `fragment`.
    pub fn with_failure_on(mut self, fragment: impl Into<String>) -> Self {
        self.fail_on = Some(fragment.into());
        self
    }

    /// Statements made durable by a commit, in execution order.
    pub fn committed(&self) -> &[String] {
        &self.committed
    }

    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    pub fn begin_count(&self) -> usize {
        self.begin_count
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanup_count
    }
}

impl DatabaseDriver for MemoryDriver {
    fn execute(&mut self, request: &DbRequest) -> Result<DbResult, DbError> {
        if let Some(fragment) = &self.fail_on {
            if request.sql.contains(fragment.as_str()) {
                return Err(DbError::Statement(format!(
                    "injected failure on {fragment:?}"
                )));
            }
        }

        match &mut self.open {
            Some(buffer) => {
                buffer.push(request.sql.clone());
                Ok(DbResult::default())
            }
            None => match self.canned.get(&request.sql) {
                Some(rows) => Ok(DbResult { rows: rows.clone() }),
                None => Err(DbError::Statement(format!(
                    "no relation answers: {}",
                    request.sql
                ))),
            },
        }
    }

    fn begin_transaction(&mut self, _isolation: IsolationLevel) -> Result<(), DbError> {
        if self.open.is_some() {
            return Err(DbError::Transaction("transaction already open".to_string()));
        }
        self.begin_count += 1;
        self.open = Some(Vec::new());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), DbError> {
        match self.open.take() {
            Some(buffer) => {
                self.committed.extend(buffer);
                Ok(())
            }
            None => Err(DbError::Transaction("no open transaction".to_string())),
        }
    }

    fn rollback_transaction(&mut self) -> Result<(), DbError> {
        match self.open.take() {
            Some(_) => Ok(()),
            None => Err(DbError::Transaction("no open transaction".to_string())),
        }
    }

    fn cleanup_transaction(&mut self) {
        self.cleanup_count += 1;
        self.open = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sql: &str) -> DbRequest {
        DbRequest {
            sql: sql.to_string(),
            statement_key: String::new(),
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_commit_makes_statements_visible() {
        let mut driver = MemoryDriver::new();
        driver
            .begin_transaction(IsolationLevel::ReadCommitted)
            .unwrap();
        driver.execute(&request("CREATE TABLE t (id INT)")).unwrap();
        driver.execute(&request("INSERT INTO t VALUES (1)")).unwrap();
        assert!(driver.committed().is_empty());

        driver.commit_transaction().unwrap();
        assert_eq!(driver.committed().len(), 2);
        assert!(!driver.in_transaction());
    }

    #[test]
    fn test_rollback_discards_statements() {
        let mut driver = MemoryDriver::new();
        driver
            .begin_transaction(IsolationLevel::ReadCommitted)
            .unwrap();
        driver.execute(&request("CREATE TABLE t (id INT)")).unwrap();
        driver.rollback_transaction().unwrap();
        assert!(driver.committed().is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let mut driver = MemoryDriver::new().with_failure_on("boom");
        driver
            .begin_transaction(IsolationLevel::ReadCommitted)
            .unwrap();
        assert!(driver.execute(&request("SELECT boom")).is_err());
    }

    #[test]
    fn test_canned_results_outside_transaction() {
        let mut driver = MemoryDriver::new()
            .with_result("SELECT 1", vec![serde_json::json!({"one": 1})]);
        let result = driver.execute(&request("SELECT 1")).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert!(driver.execute(&request("SELECT 2")).is_err());
    }
}
