//! Per-connection configuration records.
//!
//! The surrounding application loads its JSON configuration and hands each
//! database connection's record to this crate as a [`ConnectionConfig`].
//! Nothing here reads configuration files; the record is consumed read-only
//! and resolved once at orchestration start.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Marker prefix selecting the embedded payload store as migration source.
pub const PAYLOAD_SOURCE_PREFIX: &str = "PAYLOAD:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("migration source {spec:?} has an empty payload prefix")]
    EmptyPayloadPrefix { spec: String },

    #[error("migration path {path:?} has no usable basename")]
    UnusablePath { path: PathBuf },
}

/// One database connection's configuration record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Connection name, used as log label and schema fallback.
    pub name: String,

    /// Free-form engine string, normalized via [`crate::EngineKind::normalize`].
    #[serde(rename = "type")]
    pub engine: String,

    /// Target schema. Falls back to the connection name when absent.
    #[serde(default)]
    pub schema: Option<String>,

    /// Run migrations automatically for this connection.
    #[serde(default)]
    pub auto_migration: bool,

    /// Run load-only (metadata) migrations for this connection.
    #[serde(default)]
    pub test_migration: bool,

    /// Migration source: `PAYLOAD:<name>` or a filesystem path.
    #[serde(default)]
    pub migrations: Option<String>,

    /// Bootstrap query override. The built-in default is used when absent.
    #[serde(default)]
    pub bootstrap_query: Option<String>,

    /// Per-statement execution timeout, enforced by the database driver.
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

fn default_statement_timeout() -> u64 {
    30
}

impl ConnectionConfig {
    /// Resolve the migration source descriptor, or `None` when the
    /// connection has no migrations configured (a no-op for the
    /// orchestrator, not an error).
    pub fn migration_source(&self) -> Option<MigrationSource> {
        let raw = self.migrations.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        Some(MigrationSource::parse(raw))
    }

    /// Schema name passed to migration scripts.
    pub fn schema_name(&self) -> &str {
        self.schema.as_deref().unwrap_or(&self.name)
    }
}

/// Where a connection's migration scripts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSource {
    /// Scripts live in the payload store under `<prefix>/<prefix>_<version>.<ext>`.
    Embedded { prefix: String },

    /// Scripts live on disk under `<dir>/<basename>_<version>.<ext>`, where
    /// `path` is `<dir>/<basename>`.
    PathBased { path: PathBuf },
}

impl MigrationSource {
    /// Parse the configured `migrations` string. `PAYLOAD:<name>` selects
    /// the embedded store; anything else is a filesystem path.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(PAYLOAD_SOURCE_PREFIX) {
            Some(prefix) => MigrationSource::Embedded {
                prefix: prefix.trim().to_string(),
            },
            None => MigrationSource::PathBased {
                path: PathBuf::from(raw),
            },
        }
    }

    /// The migration name: payload prefix, or path basename minus extension.
    ///
    /// An empty prefix or un-basename-able path is a configuration error.
    pub fn migration_name(&self) -> Result<String, ConfigError> {
        match self {
            MigrationSource::Embedded { prefix } => {
                if prefix.is_empty() {
                    return Err(ConfigError::EmptyPayloadPrefix {
                        spec: format!("{PAYLOAD_SOURCE_PREFIX}{prefix}"),
                    });
                }
                Ok(prefix.clone())
            }
            MigrationSource::PathBased { path } => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .filter(|s| !s.is_empty());
                stem.ok_or_else(|| ConfigError::UnusablePath { path: path.clone() })
            }
        }
    }
}
