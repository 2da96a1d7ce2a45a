//! SQL generation driver.
//!
//! Drives a sandbox through the fixed call sequence for one migration
//! script: load adapter modules, load the script, invoke the migration
//! definition, invoke the apply (or load-only) generator, and copy the
//! resulting SQL out before the sandbox goes away.

use thiserror::Error;
use tracing::info;

use crate::discover::MigrationScript;
use crate::engine::EngineKind;
use crate::payload::PayloadFile;
use crate::sandbox::{Sandbox, SandboxError};

/// SQL produced for one migration script, in engine-owned memory.
///
/// `statement_count` is the number of query entries the migration
/// definition produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSql {
    pub text: String,
    pub statement_count: usize,
}

/// What the generated SQL should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Full migration SQL, schema changes included.
    Apply,
    /// Bookkeeping `INSERT`s only, recording queries as loaded (1000).
    LoadOnly,
}

/// Sandbox lifetime policy for a generation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxPolicy {
    /// One sandbox per migration script. The safe default.
    #[default]
    FreshPerScript,
    /// One sandbox for the whole batch, with an explicit reset between
    /// scripts. Saves reloading adapter modules when they are expensive.
    ReusePerBatch,
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("sandbox failure for {script:?}: {source}")]
    Sandbox {
        script: String,
        #[source]
        source: SandboxError,
    },

    #[error("migration script {script:?} generated no SQL")]
    NoSqlGenerated { script: String },
}

/// Generates SQL for the migration scripts of one connection.
///
/// Holds the per-batch payload file array (acquired once by the caller)
/// and, in reuse mode, the sandbox carried across scripts.
pub struct Generator<'a> {
    engine: EngineKind,
    migration_name: &'a str,
    schema: &'a str,
    payload_files: &'a [PayloadFile],
    policy: SandboxPolicy,
    cached: Option<Sandbox>,
}

impl<'a> Generator<'a> {
    pub fn new(
        engine: EngineKind,
        migration_name: &'a str,
        schema: &'a str,
        payload_files: &'a [PayloadFile],
        policy: SandboxPolicy,
    ) -> Self {
        Self {
            engine,
            migration_name,
            schema,
            payload_files,
            policy,
            cached: None,
        }
    }

    /// Generate SQL for one migration script.
    ///
    /// An empty or all-whitespace result is an error, not a silent skip:
    /// every discovered script is expected to produce SQL.
    pub fn generate(
        &mut self,
        script: &MigrationScript,
        mode: GenerationMode,
    ) -> Result<GeneratedSql, GenerateError> {
        let sandbox = self
            .obtain_sandbox()
            .map_err(|source| wrap(script, source))?;

        let file = Sandbox::find_script(self.payload_files, &script.name).ok_or_else(|| {
            wrap(
                script,
                SandboxError::ScriptNotFound {
                    name: script.name.clone(),
                },
            )
        })?;

        let definition = sandbox
            .load_migration_script(file)
            .map_err(|source| wrap(script, source))?;

        let (queries, count) = sandbox
            .invoke_migration_definition(&definition, self.engine, self.migration_name, self.schema)
            .map_err(|source| wrap(script, source))?;

        let text = match mode {
            GenerationMode::Apply => {
                sandbox.invoke_apply(&queries, self.engine, self.migration_name, self.schema)
            }
            GenerationMode::LoadOnly => {
                sandbox.invoke_load_only(&queries, self.engine, self.migration_name, self.schema)
            }
        }
        .map_err(|source| wrap(script, source))?;

        // The SQL is engine-owned from here on; drop every interpreter
        // reference before the sandbox is torn down or reset.
        drop(queries);
        drop(definition);

        if text.trim().is_empty() {
            return Err(GenerateError::NoSqlGenerated {
                script: script.name.clone(),
            });
        }

        let lines = text.bytes().filter(|byte| *byte == b'\n').count().max(1);
        info!(
            migration = %script.name,
            version = script.version,
            queries = count,
            lines,
            "generated migration SQL"
        );

        self.release_sandbox(sandbox)
            .map_err(|source| wrap(script, source))?;

        Ok(GeneratedSql {
            text,
            statement_count: count,
        })
    }

    fn obtain_sandbox(&mut self) -> Result<Sandbox, SandboxError> {
        if let Some(sandbox) = self.cached.take() {
            return Ok(sandbox);
        }
        let mut sandbox = Sandbox::create(self.migration_name);
        sandbox.load_adapter_modules(self.migration_name, self.payload_files)?;
        Ok(sandbox)
    }

    fn release_sandbox(&mut self, mut sandbox: Sandbox) -> Result<(), SandboxError> {
        match self.policy {
            SandboxPolicy::FreshPerScript => drop(sandbox),
            SandboxPolicy::ReusePerBatch => {
                sandbox.reset()?;
                self.cached = Some(sandbox);
            }
        }
        Ok(())
    }
}

fn wrap(script: &MigrationScript, source: SandboxError) -> GenerateError {
    GenerateError::Sandbox {
        script: script.name.clone(),
        source,
    }
}
