//! sqlgen-migrate: embedded-Lua SQL migration engine
//!
//! This library discovers ordered Lua migration scripts, runs them in an
//! embedded Lua sandbox to generate SQL, and applies the generated SQL
//! transactionally through a pluggable driver interface for PostgreSQL,
//! MySQL, SQLite, and DB2. A bootstrap probe reports each database's
//! available vs. installed migration version so callers can decide whether
//! migrations are needed at all.

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod discover;
pub mod engine;
pub mod generate;
pub mod payload;
pub mod pipeline;
pub mod sandbox;
pub mod transaction;

// Re-export commonly used types
pub use bootstrap::{BootstrapSignal, MigrationOutcome, QueryCache, QueryCacheEntry};
pub use config::{ConnectionConfig, MigrationSource};
pub use db::{DatabaseDriver, DbRequest, DbResult, IsolationLevel};
pub use discover::{Discovered, MigrationScript};
pub use engine::EngineKind;
pub use generate::{GeneratedSql, GenerationMode, SandboxPolicy};
pub use payload::{MemoryPayloadStore, PayloadFile, PayloadStore};
pub use pipeline::{MigrationPipeline, RunSummary, SkipReason};
pub use sandbox::Sandbox;
