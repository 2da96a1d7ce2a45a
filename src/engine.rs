//! Database engine identification.
//!
//! Connection configuration carries the engine as a free-form string
//! (`"postgres"`, `"mysql"`, ...). This module normalizes it into an
//! [`EngineKind`] once, at orchestration start; everything downstream
//! dispatches on the enum.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unsupported database engine type: {0:?}")]
pub struct UnknownEngine(pub String);

/// One of the four supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum EngineKind {
    PostgreSql,
    MySql,
    Sqlite,
    Db2,
}

impl EngineKind {
    /// Normalize a configuration engine string, accepting common aliases.
    ///
    /// Case-insensitive. Unsupported names are an error, never a silent
    /// default.
    pub fn normalize(raw: &str) -> Result<Self, UnknownEngine> {
        match raw.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" => Ok(Self::PostgreSql),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "db2" | "ibmdb2" => Ok(Self::Db2),
            _ => Err(UnknownEngine(raw.to_string())),
        }
    }

    /// Canonical engine name. Used as the key into the orchestration
    /// module's `defaults` table and passed to migration scripts.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::PostgreSql => "postgresql",
            EngineKind::MySql => "mysql",
            EngineKind::Sqlite => "sqlite",
            EngineKind::Db2 => "db2",
        }
    }

    /// Name of the Lua adapter module for this engine.
    ///
    /// All four adapter modules are loaded into every sandbox regardless of
    /// the engine actually targeted, so `require`-style lookups inside the
    /// orchestration module always resolve.
    pub fn adapter_module(&self) -> &'static str {
        match self {
            EngineKind::PostgreSql => "postgres",
            EngineKind::MySql => "mysql",
            EngineKind::Sqlite => "sqlite",
            EngineKind::Db2 => "db2",
        }
    }

    /// All supported engines, in adapter-module load order.
    pub fn all() -> impl Iterator<Item = EngineKind> {
        EngineKind::iter()
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
