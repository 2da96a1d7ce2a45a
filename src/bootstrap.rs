//! Bootstrap query runner.
//!
//! Runs once per lead connection, after the persistent connection is
//! established, to decide whether migrations are needed at all: it probes
//! the target schema's queries table and reports the latest available vs.
//! installed migration version. A failing probe is the expected signal for
//! an unmigrated database, never an error.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::db::{DatabaseDriver, DbRequest};
use crate::transaction::statement_key;

/// Row discriminator: query loaded, not yet applied.
pub const STATUS_LOADED: i64 = 1000;

/// Row discriminator: migration installed.
pub const STATUS_INSTALLED: i64 = 1003;

/// Probe used when the connection does not configure its own.
pub const DEFAULT_BOOTSTRAP_QUERY: &str = "SELECT version, type, query_ref, sql_template, \
     description, queue_type, timeout_seconds FROM queries";

/// Bootstrap is expected to fail fast on an empty database.
pub const BOOTSTRAP_TIMEOUT_SECS: u64 = 1;

/// What bootstrap learned about one database.
///
/// `-1` in a version field means "unknown, not yet determined"; `0` means
/// "confirmed: no migrations of that kind found".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub database_name: String,
    pub migration_available_version: i64,
    pub migration_installed_version: i64,
    pub is_empty_database: bool,
}

impl MigrationOutcome {
    /// State before any bootstrap run.
    pub fn undetermined(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            migration_available_version: -1,
            migration_installed_version: -1,
            is_empty_database: false,
        }
    }
}

/// One reusable query template from the queries table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheEntry {
    pub query_ref: i64,
    pub sql_template: String,
    pub description: String,
    pub queue_type: String,
    pub timeout_seconds: i64,
}

/// In-memory query template cache, keyed by `query_ref`.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    entries: HashMap<i64, QueryCacheEntry>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: QueryCacheEntry) {
        self.entries.insert(entry.query_ref, entry);
    }

    pub fn get(&self, query_ref: i64) -> Option<&QueryCacheEntry> {
        self.entries.get(&query_ref)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
#[error("bootstrap row is not a usable query template")]
struct MalformedRow;

/// Completion signal for threads blocking on "is bootstrap done".
///
/// Guards exactly one boolean and broadcasts on every bootstrap run,
/// successful or not, so waiters never hang.
#[derive(Debug, Default)]
pub struct BootstrapSignal {
    completed: Mutex<bool>,
    done: Condvar,
}

impl BootstrapSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_complete(&self) {
        let mut completed = self
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *completed = true;
        self.done.notify_all();
    }

    pub fn wait_complete(&self) {
        let mut completed = self
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*completed {
            completed = self
                .done
                .wait(completed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_complete(&self) -> bool {
        *self
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run the bootstrap probe for a lead connection.
///
/// Query failure is normal outcome data: the database simply has no
/// queries table yet. When `populate_query_cache` is set, rows carrying
/// the full, correctly typed template field set are inserted into `cache`
/// (created lazily); partial or mistyped rows are skipped. The signal is
/// broadcast on every path.
pub fn run_bootstrap(
    config: &ConnectionConfig,
    driver: &mut dyn DatabaseDriver,
    populate_query_cache: bool,
    cache: &mut Option<QueryCache>,
    signal: &BootstrapSignal,
) -> MigrationOutcome {
    let sql = config
        .bootstrap_query
        .as_deref()
        .unwrap_or(DEFAULT_BOOTSTRAP_QUERY);
    let request = DbRequest {
        sql: sql.to_string(),
        statement_key: statement_key(sql),
        timeout_secs: BOOTSTRAP_TIMEOUT_SECS,
    };

    let outcome = match driver.execute(&request) {
        Ok(result) => {
            let outcome = parse_rows(config, &result.rows, populate_query_cache, cache);
            info!(
                database = %config.name,
                available = outcome.migration_available_version,
                installed = outcome.migration_installed_version,
                rows = result.rows.len(),
                "bootstrap query parsed"
            );
            outcome
        }
        Err(error) => {
            // Expected on an unmigrated database: no queries table yet.
            info!(
                database = %config.name,
                error = %error,
                "bootstrap query failed, treating database as empty"
            );
            MigrationOutcome {
                database_name: config.name.clone(),
                migration_available_version: 0,
                migration_installed_version: 0,
                is_empty_database: true,
            }
        }
    };

    signal.mark_complete();
    outcome
}

fn parse_rows(
    config: &ConnectionConfig,
    rows: &[Value],
    populate_query_cache: bool,
    cache: &mut Option<QueryCache>,
) -> MigrationOutcome {
    let mut available: i64 = 0;
    let mut installed: i64 = 0;

    for row in rows {
        let version = row.get("version").and_then(Value::as_i64).unwrap_or(0);
        match row.get("type").and_then(Value::as_i64) {
            Some(STATUS_LOADED) => available = available.max(version),
            Some(STATUS_INSTALLED) => installed = installed.max(version),
            _ => {}
        }

        if populate_query_cache {
            match cache_entry(row) {
                Ok(entry) => {
                    debug!(database = %config.name, query_ref = entry.query_ref, "caching query template");
                    cache.get_or_insert_with(QueryCache::new).insert(entry);
                }
                Err(MalformedRow) => {
                    debug!(database = %config.name, "skipping row without a full template field set");
                }
            }
        }
    }

    MigrationOutcome {
        database_name: config.name.clone(),
        migration_available_version: available,
        migration_installed_version: installed,
        is_empty_database: false,
    }
}

fn cache_entry(row: &Value) -> Result<QueryCacheEntry, MalformedRow> {
    let query_ref = row.get("query_ref").and_then(Value::as_i64);
    let sql_template = row.get("sql_template").and_then(Value::as_str);
    let description = row.get("description").and_then(Value::as_str);
    let queue_type = row.get("queue_type").and_then(Value::as_str);
    let timeout_seconds = row.get("timeout_seconds").and_then(Value::as_i64);

    match (query_ref, sql_template, description, queue_type, timeout_seconds) {
        (Some(query_ref), Some(sql_template), Some(description), Some(queue_type), Some(timeout_seconds)) => {
            Ok(QueryCacheEntry {
                query_ref,
                sql_template: sql_template.to_string(),
                description: description.to_string(),
                queue_type: queue_type.to_string(),
                timeout_seconds,
            })
        }
        _ => Err(MalformedRow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDriver;
    use serde_json::json;
    use std::sync::Arc;

    fn config(name: &str) -> ConnectionConfig {
        serde_json::from_str(&format!(r#"{{"name": "{name}", "type": "postgres"}}"#))
            .expect("Failed to parse connection config")
    }

    #[test]
    fn test_bootstrap_failure_is_not_fatal() {
        let cfg = config("fresh");
        let mut driver = MemoryDriver::new();
        let signal = BootstrapSignal::new();
        let mut cache = None;

        let outcome = run_bootstrap(&cfg, &mut driver, false, &mut cache, &signal);
        assert_eq!(
            outcome,
            MigrationOutcome {
                database_name: "fresh".to_string(),
                migration_available_version: 0,
                migration_installed_version: 0,
                is_empty_database: true,
            }
        );
        assert!(signal.is_complete());
        assert!(cache.is_none());
    }

    #[test]
    fn test_bootstrap_tracks_version_maxima() {
        let cfg = config("live");
        let rows = vec![
            json!({"version": 3, "type": 1000}),
            json!({"version": 7, "type": 1000}),
            json!({"version": 5, "type": 1003}),
            json!({"version": 2, "type": 1003}),
            json!({"version": 9, "type": 42}),
        ];
        let mut driver = MemoryDriver::new().with_result(DEFAULT_BOOTSTRAP_QUERY, rows);
        let signal = BootstrapSignal::new();
        let mut cache = None;

        let outcome = run_bootstrap(&cfg, &mut driver, false, &mut cache, &signal);
        assert_eq!(outcome.migration_available_version, 7);
        assert_eq!(outcome.migration_installed_version, 5);
        assert!(!outcome.is_empty_database);
    }

    #[test]
    fn test_bootstrap_zero_rows_is_confirmed_empty_counts() {
        let cfg = config("blank");
        let mut driver = MemoryDriver::new().with_result(DEFAULT_BOOTSTRAP_QUERY, vec![]);
        let signal = BootstrapSignal::new();
        let mut cache = None;

        let outcome = run_bootstrap(&cfg, &mut driver, false, &mut cache, &signal);
        assert_eq!(outcome.migration_available_version, 0);
        assert_eq!(outcome.migration_installed_version, 0);
        assert!(!outcome.is_empty_database);
    }

    #[test]
    fn test_bootstrap_populates_query_cache() {
        let cfg = config("live");
        let rows = vec![
            json!({
                "version": 1, "type": 1000,
                "query_ref": 42,
                "sql_template": "SELECT * FROM jobs WHERE id = ?",
                "description": "job by id",
                "queue_type": "fast",
                "timeout_seconds": 5
            }),
            // Missing queue_type: skipped, not fatal.
            json!({
                "version": 1, "type": 1000,
                "query_ref": 43,
                "sql_template": "SELECT 1",
                "description": "incomplete",
                "timeout_seconds": 5
            }),
            // Mistyped query_ref: skipped.
            json!({
                "version": 1, "type": 1000,
                "query_ref": "not a number",
                "sql_template": "SELECT 2",
                "description": "mistyped",
                "queue_type": "slow",
                "timeout_seconds": 5
            }),
        ];
        let mut driver = MemoryDriver::new().with_result(DEFAULT_BOOTSTRAP_QUERY, rows);
        let signal = BootstrapSignal::new();
        let mut cache = None;

        run_bootstrap(&cfg, &mut driver, true, &mut cache, &signal);
        let cache = cache.expect("cache should be created lazily");
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(42).unwrap().sql_template,
            "SELECT * FROM jobs WHERE id = ?"
        );
    }

    #[test]
    fn test_cache_not_created_unless_requested() {
        let cfg = config("live");
        let rows = vec![json!({
            "version": 1, "type": 1000,
            "query_ref": 42,
            "sql_template": "SELECT 1",
            "description": "d",
            "queue_type": "fast",
            "timeout_seconds": 5
        })];
        let mut driver = MemoryDriver::new().with_result(DEFAULT_BOOTSTRAP_QUERY, rows);
        let signal = BootstrapSignal::new();
        let mut cache = None;

        run_bootstrap(&cfg, &mut driver, false, &mut cache, &signal);
        assert!(cache.is_none());
    }

    #[test]
    fn test_configured_bootstrap_query_wins() {
        let mut cfg = config("custom");
        cfg.bootstrap_query = Some("SELECT version, type FROM app_queries".to_string());
        let rows = vec![json!({"version": 4, "type": 1003})];
        let mut driver =
            MemoryDriver::new().with_result("SELECT version, type FROM app_queries", rows);
        let signal = BootstrapSignal::new();
        let mut cache = None;

        let outcome = run_bootstrap(&cfg, &mut driver, false, &mut cache, &signal);
        assert_eq!(outcome.migration_installed_version, 4);
        assert!(!outcome.is_empty_database);
    }

    #[test]
    fn test_signal_unblocks_waiter() {
        let signal = Arc::new(BootstrapSignal::new());
        let waiter_signal = Arc::clone(&signal);
        let waiter = std::thread::spawn(move || {
            waiter_signal.wait_complete();
            true
        });

        signal.mark_complete();
        assert!(waiter.join().expect("waiter thread panicked"));
    }
}
