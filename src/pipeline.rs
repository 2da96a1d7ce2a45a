//! Migration pipeline — the top-level execution orchestrator.
//!
//! One pipeline serves one connection. It resolves the connection's engine
//! and migration source, discovers the ordered script set, and runs each
//! script through generation and transactional application, stopping at
//! the first failure. Later-version scripts are never attempted once an
//! earlier one fails.

use thiserror::Error;
use tracing::{error, info};

use crate::config::{ConfigError, ConnectionConfig, MigrationSource};
use crate::db::DatabaseDriver;
use crate::discover::{self, DiscoverError, MigrationScript};
use crate::engine::{EngineKind, UnknownEngine};
use crate::generate::{GenerateError, GenerationMode, Generator, SandboxPolicy};
use crate::payload::{MODULE_PREFIX, PayloadFile, PayloadStore};
use crate::transaction::{self, TransactionError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("connection {connection:?}: {source}")]
    Engine {
        connection: String,
        #[source]
        source: UnknownEngine,
    },

    #[error("connection {connection:?}: {source}")]
    Config {
        connection: String,
        #[source]
        source: ConfigError,
    },

    #[error("connection {connection:?}: {source}")]
    Discover {
        connection: String,
        #[source]
        source: DiscoverError,
    },

    #[error("cannot read migration script {name:?}: {source}")]
    ScriptRead {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("migration {script:?}: {source}")]
    Generate {
        script: String,
        #[source]
        source: GenerateError,
    },

    #[error("migration {script:?}: {source}")]
    Apply {
        script: String,
        #[source]
        source: TransactionError,
    },
}

/// Why a run did nothing, when it did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MigrationDisabled,
    NoSourceConfigured,
}

/// Result of one orchestrated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub connection: String,
    pub scripts_applied: usize,
    pub skipped: Option<SkipReason>,
}

/// Orchestrates migrations for one connection.
pub struct MigrationPipeline<'a> {
    config: &'a ConnectionConfig,
    store: &'a dyn PayloadStore,
    policy: SandboxPolicy,
}

impl<'a> MigrationPipeline<'a> {
    pub fn new(config: &'a ConnectionConfig, store: &'a dyn PayloadStore) -> Self {
        Self {
            config,
            store,
            policy: SandboxPolicy::default(),
        }
    }

    /// Opt in to sandbox reuse across the scripts of one run.
    pub fn with_sandbox_policy(mut self, policy: SandboxPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the connection's migrations, applying generated SQL.
    ///
    /// No-op success when `auto_migration` is off or no source is
    /// configured.
    pub fn execute_auto(
        &self,
        driver: &mut dyn DatabaseDriver,
    ) -> Result<RunSummary, PipelineError> {
        self.execute(driver, self.config.auto_migration, GenerationMode::Apply)
    }

    /// Run the connection's migrations in load-only mode: bookkeeping
    /// `INSERT`s are generated and applied, schema is never altered.
    ///
    /// No-op success when `test_migration` is off or no source is
    /// configured.
    pub fn execute_load_migrations(
        &self,
        driver: &mut dyn DatabaseDriver,
    ) -> Result<RunSummary, PipelineError> {
        self.execute(driver, self.config.test_migration, GenerationMode::LoadOnly)
    }

    fn execute(
        &self,
        driver: &mut dyn DatabaseDriver,
        enabled: bool,
        mode: GenerationMode,
    ) -> Result<RunSummary, PipelineError> {
        let connection = &self.config.name;

        if !enabled {
            info!(connection = %connection, "migration disabled, nothing to do");
            return Ok(self.skipped(SkipReason::MigrationDisabled));
        }
        let Some(source) = self.config.migration_source() else {
            info!(connection = %connection, "no migration source configured, nothing to do");
            return Ok(self.skipped(SkipReason::NoSourceConfigured));
        };

        let engine =
            EngineKind::normalize(&self.config.engine).map_err(|source| PipelineError::Engine {
                connection: connection.clone(),
                source,
            })?;
        let migration_name = source
            .migration_name()
            .map_err(|source| PipelineError::Config {
                connection: connection.clone(),
                source,
            })?;

        let discovered =
            discover::discover(&source, self.store).map_err(|source| PipelineError::Discover {
                connection: connection.clone(),
                source,
            })?;
        info!(
            connection = %connection,
            migration = %migration_name,
            scripts = discovered.scripts.len(),
            "migration scripts discovered"
        );
        if discovered.is_empty() {
            return Ok(RunSummary {
                connection: connection.clone(),
                scripts_applied: 0,
                skipped: None,
            });
        }

        // One payload acquisition for the whole batch; the generator
        // borrows it across every script.
        let batch = self.load_batch(&source, &discovered.scripts)?;
        let schema = self.config.schema_name();
        let mut generator = Generator::new(engine, &migration_name, schema, &batch, self.policy);

        let mut applied = 0usize;
        for script in &discovered.scripts {
            self.run_script(driver, &mut generator, engine, script, mode)
                .inspect_err(|error| {
                    error!(
                        connection = %connection,
                        migration = %script.name,
                        version = script.version,
                        error = %error,
                        "migration failed, aborting batch"
                    );
                })?;
            applied += 1;
        }

        info!(connection = %connection, scripts = applied, "migration batch complete");
        Ok(RunSummary {
            connection: connection.clone(),
            scripts_applied: applied,
            skipped: None,
        })
    }

    fn run_script(
        &self,
        driver: &mut dyn DatabaseDriver,
        generator: &mut Generator<'_>,
        engine: EngineKind,
        script: &MigrationScript,
        mode: GenerationMode,
    ) -> Result<(), PipelineError> {
        let generated = generator
            .generate(script, mode)
            .map_err(|source| PipelineError::Generate {
                script: script.name.clone(),
                source,
            })?;

        transaction::apply(
            driver,
            engine,
            &generated,
            &script.name,
            self.config.statement_timeout_secs,
        )
        .map_err(|source| PipelineError::Apply {
            script: script.name.clone(),
            source,
        })?;

        Ok(())
    }

    /// Gather the payload batch for a run: the Lua modules plus every
    /// migration script, read once up front.
    fn load_batch(
        &self,
        source: &MigrationSource,
        scripts: &[MigrationScript],
    ) -> Result<Vec<PayloadFile>, PipelineError> {
        let mut files = self.store.files_by_prefix(MODULE_PREFIX);
        match source {
            MigrationSource::Embedded { prefix } => {
                files.extend(self.store.files_by_prefix(prefix));
            }
            MigrationSource::PathBased { .. } => {
                for script in scripts {
                    let data = std::fs::read(&script.name).map_err(|source| {
                        PipelineError::ScriptRead {
                            name: script.name.clone(),
                            source,
                        }
                    })?;
                    files.push(PayloadFile::new(script.name.clone(), data));
                }
            }
        }
        Ok(files)
    }

    fn skipped(&self, reason: SkipReason) -> RunSummary {
        RunSummary {
            connection: self.config.name.clone(),
            scripts_applied: 0,
            skipped: Some(reason),
        }
    }
}
