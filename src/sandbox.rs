//! Embedded Lua sandbox.
//!
//! The sandbox is a code generator, not an extension point: it loads the
//! engine adapter modules and the orchestration module, runs one migration
//! script, and hands back the SQL string the script produced. A sandbox
//! instance is owned by one thread for the duration of one generation call
//! (or one reuse batch) and is never shared.
//!
//! Interpreter-owned strings are only valid while the owning `Lua` state is
//! alive. Every string crossing back into engine code goes through
//! [`copy_out_before_close`] before any further sandbox operation.

use mlua::{Function, Lua, Table, Value};
use thiserror::Error;
use tracing::debug;

use crate::engine::EngineKind;
use crate::payload::{MODULE_PREFIX, PayloadFile};

/// Name of the shared orchestration module.
pub const ORCHESTRATION_MODULE: &str = "migration";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("adapter module {module:?} is missing from the payload batch")]
    ModuleMissing { module: String },

    #[error("adapter module {module:?} failed to load: {message}")]
    ModuleLoad { module: String, message: String },

    #[error("adapter module {module:?} must return a table, got {found}")]
    ModuleReturnType { module: String, found: &'static str },

    #[error("adapter modules are not loaded")]
    ModulesNotLoaded,

    #[error("script {name:?} not found in payload batch")]
    ScriptNotFound { name: String },

    #[error("script {name:?} failed to load: {message}")]
    ScriptLoad { name: String, message: String },

    #[error("script {name:?} must return a {expected}, got {found}")]
    ScriptReturnType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{what} failed: {message}")]
    Invoke { what: String, message: String },

    #[error("interpreter error: {0}")]
    Interpreter(String),
}

/// One embedded interpreter instance.
pub struct Sandbox {
    lua: Lua,
    label: String,
    orchestration: Option<Table>,
}

impl Sandbox {
    /// Fresh interpreter with the standard libraries loaded.
    pub fn create(label: impl Into<String>) -> Self {
        let label = label.into();
        debug!(sandbox = %label, "sandbox created");
        Self {
            lua: Lua::new(),
            label,
            orchestration: None,
        }
    }

    /// Load one adapter module per supported engine plus the orchestration
    /// module.
    ///
    /// All four adapters load unconditionally, regardless of the engine
    /// actually targeted, so the orchestration module's `require` lookups
    /// always resolve. Each module chunk must evaluate to a table; the
    /// table is registered both in `package.loaded` and as a global. The
    /// first failing module aborts the whole load.
    pub fn load_adapter_modules(
        &mut self,
        migration_name: &str,
        files: &[PayloadFile],
    ) -> Result<(), SandboxError> {
        for engine in EngineKind::all() {
            let module = engine.adapter_module();
            let table = self.eval_module(module, files)?;
            self.register_module(module, &table)?;
        }

        let orchestration = self.eval_module(ORCHESTRATION_MODULE, files)?;
        self.register_module(ORCHESTRATION_MODULE, &orchestration)?;
        self.orchestration = Some(orchestration);

        debug!(
            sandbox = %self.label,
            migration = migration_name,
            "adapter and orchestration modules loaded"
        );
        Ok(())
    }

    /// Exact-name lookup in the payload batch.
    pub fn find_script<'f>(files: &'f [PayloadFile], name: &str) -> Option<&'f PayloadFile> {
        files.iter().find(|file| file.name == name)
    }

    /// Compile and run a migration script chunk. The chunk must return
    /// exactly one function.
    pub fn load_migration_script(&self, file: &PayloadFile) -> Result<Function, SandboxError> {
        let value: Value = self
            .lua
            .load(&file.data[..])
            .set_name(file.name.as_str())
            .eval()
            .map_err(|error| SandboxError::ScriptLoad {
                name: file.name.clone(),
                message: lua_message(&error),
            })?;

        match value {
            Value::Function(definition) => Ok(definition),
            other => Err(SandboxError::ScriptReturnType {
                name: file.name.clone(),
                expected: "function",
                found: other.type_name(),
            }),
        }
    }

    /// Call the migration definition function with
    /// `(engine, migration_name, schema, defaults[engine])`.
    ///
    /// The result must be a table of query entries; it is iterated only to
    /// count entries for logging, the entry shape is not validated here.
    pub fn invoke_migration_definition(
        &self,
        definition: &Function,
        engine: EngineKind,
        migration_name: &str,
        schema: &str,
    ) -> Result<(Table, usize), SandboxError> {
        let defaults: Value = self
            .orchestration()?
            .get::<Table>("defaults")
            .and_then(|table| table.get::<Value>(engine.as_str()))
            .map_err(|error| SandboxError::Interpreter(lua_message(&error)))?;

        let value: Value = definition
            .call((engine.as_str(), migration_name, schema, defaults))
            .map_err(|error| SandboxError::Invoke {
                what: format!("migration definition for {migration_name:?}"),
                message: lua_message(&error),
            })?;

        let queries = match value {
            Value::Table(queries) => queries,
            other => {
                return Err(SandboxError::ScriptReturnType {
                    name: migration_name.to_string(),
                    expected: "table",
                    found: other.type_name(),
                });
            }
        };

        let mut count = 0usize;
        for pair in queries.clone().pairs::<Value, Value>() {
            pair.map_err(|error| SandboxError::Interpreter(lua_message(&error)))?;
            count += 1;
        }
        debug!(
            sandbox = %self.label,
            migration = migration_name,
            queries = count,
            "migration definition evaluated"
        );

        Ok((queries, count))
    }

    /// Generate the executable SQL batch via `migration:run_migration`.
    pub fn invoke_apply(
        &self,
        queries: &Table,
        engine: EngineKind,
        migration_name: &str,
        schema: &str,
    ) -> Result<String, SandboxError> {
        self.invoke_generator("run_migration", queries, engine, migration_name, schema)
    }

    /// Generate only the status-1000 bookkeeping `INSERT`s via
    /// `migration:load_migration`, leaving schema untouched.
    pub fn invoke_load_only(
        &self,
        queries: &Table,
        engine: EngineKind,
        migration_name: &str,
        schema: &str,
    ) -> Result<String, SandboxError> {
        self.invoke_generator("load_migration", queries, engine, migration_name, schema)
    }

    /// Reset a reused sandbox back to its post-module-load baseline.
    ///
    /// Forces a full collection cycle between migrations; repeated
    /// compilations in a long-lived state otherwise accumulate garbage and
    /// risk cross-migration state leakage. Two passes so objects
    /// resurrected by finalizers are collected as well.
    pub fn reset(&mut self) -> Result<(), SandboxError> {
        self.lua
            .gc_collect()
            .and_then(|()| self.lua.gc_collect())
            .map_err(|error| SandboxError::Interpreter(lua_message(&error)))?;
        debug!(sandbox = %self.label, "sandbox reset");
        Ok(())
    }

    fn invoke_generator(
        &self,
        method: &'static str,
        queries: &Table,
        engine: EngineKind,
        migration_name: &str,
        schema: &str,
    ) -> Result<String, SandboxError> {
        let orchestration = self.orchestration()?;
        let generator: Function =
            orchestration
                .get(method)
                .map_err(|error| SandboxError::Invoke {
                    what: format!("{ORCHESTRATION_MODULE}.{method} lookup"),
                    message: lua_message(&error),
                })?;

        let value: Value = generator
            .call((
                orchestration.clone(),
                queries.clone(),
                engine.as_str(),
                migration_name,
                schema,
            ))
            .map_err(|error| SandboxError::Invoke {
                what: format!("{ORCHESTRATION_MODULE}.{method}"),
                message: lua_message(&error),
            })?;

        let text = match value {
            Value::String(text) => text,
            other => {
                return Err(SandboxError::ScriptReturnType {
                    name: format!("{ORCHESTRATION_MODULE}.{method}"),
                    expected: "string",
                    found: other.type_name(),
                });
            }
        };

        Ok(copy_out_before_close(&text))
    }

    fn orchestration(&self) -> Result<&Table, SandboxError> {
        self.orchestration
            .as_ref()
            .ok_or(SandboxError::ModulesNotLoaded)
    }

    fn eval_module(&self, module: &str, files: &[PayloadFile]) -> Result<Table, SandboxError> {
        let wanted = format!("{MODULE_PREFIX}/{module}.lua");
        let file =
            Self::find_script(files, &wanted).ok_or_else(|| SandboxError::ModuleMissing {
                module: module.to_string(),
            })?;

        let value: Value = self
            .lua
            .load(&file.data[..])
            .set_name(file.name.as_str())
            .eval()
            .map_err(|error| SandboxError::ModuleLoad {
                module: module.to_string(),
                message: lua_message(&error),
            })?;

        match value {
            Value::Table(table) => Ok(table),
            other => Err(SandboxError::ModuleReturnType {
                module: module.to_string(),
                found: other.type_name(),
            }),
        }
    }

    fn register_module(&self, name: &str, table: &Table) -> Result<(), SandboxError> {
        let globals = self.lua.globals();
        let loaded: Table = globals
            .get::<Table>("package")
            .and_then(|package| package.get::<Table>("loaded"))
            .map_err(|error| SandboxError::Interpreter(lua_message(&error)))?;
        loaded
            .set(name, table.clone())
            .and_then(|()| globals.set(name, table.clone()))
            .map_err(|error| SandboxError::Interpreter(lua_message(&error)))
    }
}

/// Copy an interpreter-owned string into engine-owned memory.
///
/// Must run before the sandbox that produced the string is reset or
/// destroyed; teardown invalidates interpreter-internal buffers, so the
/// returned `String` is the only handle allowed to outlive the sandbox.
pub fn copy_out_before_close(text: &mlua::String) -> String {
    text.to_string_lossy().to_string()
}

fn lua_message(error: &mlua::Error) -> String {
    let message = error.to_string();
    if message.trim().is_empty() {
        "unknown error".to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::builtin_modules;

    const USERS_SCRIPT: &str = r#"
return function(engine, migration, schema, defaults)
  return {
    {
      ref = 101,
      version = 1,
      desc = "create users table",
      sql = "CREATE TABLE " .. schema .. ".users (id " .. defaults.serial_type .. " PRIMARY KEY, name " .. defaults.text_type .. " NOT NULL)",
    },
    {
      ref = 102,
      version = 1,
      desc = "index users by name",
      sql = "CREATE INDEX users_name_idx ON " .. schema .. ".users (name)",
    },
  }
end
"#;

    fn loaded_sandbox() -> Sandbox {
        let mut sandbox = Sandbox::create("test");
        sandbox
            .load_adapter_modules("users", &builtin_modules())
            .expect("Failed to load builtin modules");
        sandbox
    }

    fn users_file() -> PayloadFile {
        PayloadFile::new("users/users_00001.lua", USERS_SCRIPT)
    }

    #[test]
    fn test_load_adapter_modules_requires_all_engines() {
        let mut files = builtin_modules();
        files.retain(|file| !file.name.ends_with("db2.lua"));

        let mut sandbox = Sandbox::create("test");
        let err = sandbox.load_adapter_modules("users", &files).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ModuleMissing { ref module } if module == "db2"
        ));
    }

    #[test]
    fn test_module_must_return_table() {
        let mut files = builtin_modules();
        for file in &mut files {
            if file.name.ends_with("mysql.lua") {
                file.data = b"return 42".to_vec();
            }
        }

        let mut sandbox = Sandbox::create("test");
        let err = sandbox.load_adapter_modules("users", &files).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ModuleReturnType { ref module, found: "integer" } if module == "mysql"
        ));
    }

    #[test]
    fn test_migration_script_must_return_function() {
        let sandbox = loaded_sandbox();
        let file = PayloadFile::new("users/users_00001.lua", "return { not_a_function = true }");
        let err = sandbox.load_migration_script(&file).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ScriptReturnType {
                expected: "function",
                ..
            }
        ));
    }

    #[test]
    fn test_script_compile_error_carries_interpreter_message() {
        let sandbox = loaded_sandbox();
        let file = PayloadFile::new("users/users_00001.lua", "return function( -- broken");
        let err = sandbox.load_migration_script(&file).unwrap_err();
        match err {
            SandboxError::ScriptLoad { message, .. } => assert!(!message.is_empty()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_definition_and_apply_generate_sql() {
        let sandbox = loaded_sandbox();
        let definition = sandbox.load_migration_script(&users_file()).unwrap();
        let (queries, count) = sandbox
            .invoke_migration_definition(&definition, EngineKind::PostgreSql, "users", "inv")
            .unwrap();
        assert_eq!(count, 2);

        let sql = sandbox
            .invoke_apply(&queries, EngineKind::PostgreSql, "users", "inv")
            .unwrap();
        assert!(sql.contains("CREATE TABLE inv.users"));
        assert!(sql.contains("BIGSERIAL"));
        assert!(sql.contains(crate::transaction::STATEMENT_DELIMITER));
    }

    #[test]
    fn test_defaults_follow_target_engine() {
        let sandbox = loaded_sandbox();
        let definition = sandbox.load_migration_script(&users_file()).unwrap();
        let (queries, _) = sandbox
            .invoke_migration_definition(&definition, EngineKind::MySql, "users", "inv")
            .unwrap();
        let sql = sandbox
            .invoke_apply(&queries, EngineKind::MySql, "users", "inv")
            .unwrap();
        assert!(sql.contains("AUTO_INCREMENT"));
        assert!(!sql.contains("BIGSERIAL"));
    }

    #[test]
    fn test_load_only_emits_bookkeeping_inserts() {
        let sandbox = loaded_sandbox();
        let definition = sandbox.load_migration_script(&users_file()).unwrap();
        let (queries, _) = sandbox
            .invoke_migration_definition(&definition, EngineKind::Sqlite, "users", "inv")
            .unwrap();
        let sql = sandbox
            .invoke_load_only(&queries, EngineKind::Sqlite, "users", "inv")
            .unwrap();

        for statement in crate::transaction::split_statements(&sql) {
            assert!(statement.starts_with("INSERT INTO inv.queries"));
            assert!(statement.contains("1000"));
        }
        assert!(!sql.contains("CREATE"));
    }

    #[test]
    fn test_generated_sql_outlives_sandbox() {
        let sandbox = loaded_sandbox();
        let definition = sandbox.load_migration_script(&users_file()).unwrap();
        let (queries, _) = sandbox
            .invoke_migration_definition(&definition, EngineKind::PostgreSql, "users", "inv")
            .unwrap();
        let sql = sandbox
            .invoke_apply(&queries, EngineKind::PostgreSql, "users", "inv")
            .unwrap();
        let snapshot = sql.clone();

        drop(queries);
        drop(definition);
        drop(sandbox);

        assert_eq!(sql, snapshot);
    }

    #[test]
    fn test_reset_keeps_modules_loaded() {
        let mut sandbox = loaded_sandbox();
        let definition = sandbox.load_migration_script(&users_file()).unwrap();
        drop(definition);
        sandbox.reset().unwrap();

        // Modules survive the reset; a second script load works on the
        // same instance.
        let definition = sandbox.load_migration_script(&users_file()).unwrap();
        let (_, count) = sandbox
            .invoke_migration_definition(&definition, EngineKind::Db2, "users", "inv")
            .unwrap();
        assert_eq!(count, 2);
    }
}
