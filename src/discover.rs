//! Migration script discovery and pre-flight validation.
//!
//! Discovery enumerates candidate migration files for a connection, extracts
//! a numeric version from each filename, and returns them in ascending
//! version order. Filenames follow `<base>_<digits>.<ext>` where `<base>` is
//! the payload prefix (embedded source) or the configured path's basename
//! (path-based source), and `<digits>` is a 1 to 6 digit version number.

use std::path::Path;

use thiserror::Error;

use crate::config::MigrationSource;
use crate::payload::PayloadStore;

/// Versions longer than this many digits are skipped during discovery.
pub const MAX_VERSION_DIGITS: usize = 6;

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("cannot read migration directory {path:?}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("duplicate migration version {version} ({first:?} and {second:?})")]
    DuplicateVersion {
        version: u64,
        first: String,
        second: String,
    },
}

/// One discovered migration script.
///
/// `name` is the payload entry name (embedded source) or the filesystem
/// path (path-based source); either is the exact lookup key the generation
/// driver uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub name: String,
    pub version: u64,
}

/// Lowest and highest version among the discovered scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionSpan {
    pub lowest: u64,
    pub highest: u64,
}

/// Discovery result: scripts in strictly ascending version order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub scripts: Vec<MigrationScript>,
    pub span: Option<VersionSpan>,
}

impl Discovered {
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Enumerate migration scripts for the given source.
///
/// Entries whose version digits are unparseable, empty, or longer than
/// [`MAX_VERSION_DIGITS`] are skipped, not fatal. Two entries sharing a
/// version are an error, never silently resolved. Zero valid entries is
/// `Ok` with an empty list: nothing to do.
pub fn discover(
    source: &MigrationSource,
    store: &dyn PayloadStore,
) -> Result<Discovered, DiscoverError> {
    let mut scripts = match source {
        MigrationSource::Embedded { prefix } => discover_embedded(prefix, store),
        MigrationSource::PathBased { path } => discover_path(path)?,
    };

    scripts.sort_by(|a, b| a.version.cmp(&b.version));

    for pair in scripts.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(DiscoverError::DuplicateVersion {
                version: pair[0].version,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }

    let span = match (scripts.first(), scripts.last()) {
        (Some(first), Some(last)) => Some(VersionSpan {
            lowest: first.version,
            highest: last.version,
        }),
        _ => None,
    };

    Ok(Discovered { scripts, span })
}

/// Confirm that at least one migration script is resolvable for the source.
///
/// Performs the same pattern search as [`discover`] but stops at the first
/// match and never opens a file. Unreadable directories count as "nothing
/// resolvable".
pub fn validate(source: &MigrationSource, store: &dyn PayloadStore) -> bool {
    match source {
        MigrationSource::Embedded { prefix } => store
            .files_by_prefix(prefix)
            .iter()
            .any(|file| embedded_version(&file.name, prefix).is_some()),
        MigrationSource::PathBased { path } => {
            let Some((dir, base)) = split_path_source(path) else {
                return false;
            };
            let Ok(entries) = std::fs::read_dir(dir) else {
                return false;
            };
            entries.flatten().any(|entry| {
                extract_version(&entry.file_name().to_string_lossy(), &base).is_some()
            })
        }
    }
}

fn discover_embedded(prefix: &str, store: &dyn PayloadStore) -> Vec<MigrationScript> {
    let mut scripts = Vec::new();
    for file in store.files_by_prefix(prefix) {
        match embedded_version(&file.name, prefix) {
            Some(version) => scripts.push(MigrationScript {
                name: file.name,
                version,
            }),
            None => {
                tracing::debug!(entry = %file.name, "skipping payload entry without a version suffix");
            }
        }
    }
    scripts
}

fn discover_path(path: &Path) -> Result<Vec<MigrationScript>, DiscoverError> {
    let Some((dir, base)) = split_path_source(path) else {
        return Ok(Vec::new());
    };

    let entries = std::fs::read_dir(dir).map_err(|source| DiscoverError::Directory {
        path: dir.to_string_lossy().to_string(),
        source,
    })?;

    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DiscoverError::Directory {
            path: dir.to_string_lossy().to_string(),
            source,
        })?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        match extract_version(&file_name, &base) {
            Some(version) => scripts.push(MigrationScript {
                name: entry.path().to_string_lossy().to_string(),
                version,
            }),
            None => {
                tracing::debug!(entry = %file_name, "skipping directory entry without a version suffix");
            }
        }
    }
    Ok(scripts)
}

/// Split a configured path into (parent directory, basename minus extension).
fn split_path_source(path: &Path) -> Option<(&Path, String)> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty())?;
    let base = path.file_stem()?.to_string_lossy().to_string();
    if base.is_empty() {
        return None;
    }
    Some((dir, base))
}

/// Version of an embedded payload entry named `<prefix>/<prefix>_<digits>.<ext>`.
fn embedded_version(entry_name: &str, prefix: &str) -> Option<u64> {
    let file_name = entry_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))?;
    extract_version(file_name, prefix)
}

/// Extract the version from a filename matching `<base>_<digits>.<ext>`.
///
/// `<digits>` must be 1 to [`MAX_VERSION_DIGITS`] ASCII digits and `<ext>`
/// must be non-empty; anything else is no match.
fn extract_version(file_name: &str, base: &str) -> Option<u64> {
    let rest = file_name
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('_'))?;
    let (digits, ext) = rest.rsplit_once('.')?;
    if ext.is_empty() || digits.is_empty() || digits.len() > MAX_VERSION_DIGITS {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
