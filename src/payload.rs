//! Payload file store interface.
//!
//! The payload store supplies named byte blobs: migration scripts and the
//! Lua adapter/orchestration modules. The engine only reads from it; stores
//! must tolerate concurrent readers.

use std::collections::BTreeMap;

/// Payload prefix under which the adapter and orchestration modules live.
pub const MODULE_PREFIX: &str = "modules";

/// One named blob from the payload store. Owned copy; callers free it by
/// dropping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl PayloadFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Read interface to the payload store.
///
/// `files_by_prefix` returns owned copies of every entry under
/// `<prefix>/`, in a deterministic order.
pub trait PayloadStore: Send + Sync {
    fn files_by_prefix(&self, prefix: &str) -> Vec<PayloadFile>;
}

/// In-memory payload store.
///
/// `new()` comes pre-seeded with the built-in Lua modules; embedders add
/// their migration scripts on top. Backed by a `BTreeMap` so listing order
/// is stable across calls.
#[derive(Debug, Clone, Default)]
pub struct MemoryPayloadStore {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryPayloadStore {
    /// A store holding the built-in adapter and orchestration modules.
    pub fn new() -> Self {
        let mut store = Self::empty();
        for file in builtin_modules() {
            store.insert(file.name, file.data);
        }
        store
    }

    /// A store with no entries, not even the built-in modules.
    pub fn empty() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), data.into());
    }

    /// Builder-style `insert`.
    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn files_by_prefix(&self, prefix: &str) -> Vec<PayloadFile> {
        let wanted = format!("{prefix}/");
        self.files
            .iter()
            .filter(|(name, _)| name.starts_with(&wanted))
            .map(|(name, data)| PayloadFile::new(name.clone(), data.clone()))
            .collect()
    }
}

/// The Lua modules shipped embedded in the crate: one adapter module per
/// supported engine plus the shared orchestration module.
pub fn builtin_modules() -> Vec<PayloadFile> {
    vec![
        PayloadFile::new(
            format!("{MODULE_PREFIX}/postgres.lua"),
            include_str!("lua/postgres.lua").as_bytes().to_vec(),
        ),
        PayloadFile::new(
            format!("{MODULE_PREFIX}/mysql.lua"),
            include_str!("lua/mysql.lua").as_bytes().to_vec(),
        ),
        PayloadFile::new(
            format!("{MODULE_PREFIX}/sqlite.lua"),
            include_str!("lua/sqlite.lua").as_bytes().to_vec(),
        ),
        PayloadFile::new(
            format!("{MODULE_PREFIX}/db2.lua"),
            include_str!("lua/db2.lua").as_bytes().to_vec(),
        ),
        PayloadFile::new(
            format!("{MODULE_PREFIX}/migration.lua"),
            include_str!("lua/migration.lua").as_bytes().to_vec(),
        ),
    ]
}
