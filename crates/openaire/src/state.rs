//! Per-table part state ledger and table lock.
//!
//! The ledger records how far each part has progressed and is stored next to
//! the parts at `<part_location>/_openaire_state.json`. File names on disk and
//! the staging listing remain the source of truth for skipping work; the
//! ledger is reconciled from them at the start of each stage and saved at
//! checkpoints so operators can see where a run stopped.
//!
//! # Atomic Writes
//!
//! The ledger is written to `_openaire_state.json.tmp` and renamed over the
//! final file, so it is never partially written.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{
    CreateLockSnafu, ParseStateSnafu, ReadStateSnafu, SerializeStateSnafu, StateError,
    TableLockedSnafu, WriteStateSnafu,
};
use crate::part::{self, raw_name};
use crate::table::Table;

/// Ledger file name inside a table's part directory.
pub const STATE_FILE: &str = "_openaire_state.json";

/// Lock file name inside a table's part directory.
pub const LOCK_FILE: &str = ".openaire.lock";

fn default_schema_version() -> u32 {
    1
}

/// How far a part has progressed. Ordered; a part only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    Extracted,
    Sanitized,
    Staged,
    Loaded,
}

/// Serialized ledger contents.
///
/// ```json
/// {
///   "schema_version": 1,
///   "table": "publication",
///   "parts": { "part-00000.json.gz": "staged" },
///   "last_update_ts": 1702598400
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub table: String,
    /// Raw part name to status.
    #[serde(default)]
    pub parts: BTreeMap<String, PartStatus>,
    #[serde(default)]
    pub last_update_ts: i64,
}

/// Persisted per-table map from part to status.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: LedgerState,
}

impl Ledger {
    /// Open the ledger in `dir`, starting empty if none exists.
    ///
    /// An unreadable ledger is discarded with a warning; reconciliation
    /// rebuilds it from the files.
    pub fn open(dir: &Path, table: &str) -> Result<Self, StateError> {
        let path = dir.join(STATE_FILE);
        let fresh = LedgerState {
            schema_version: default_schema_version(),
            table: table.to_string(),
            ..Default::default()
        };

        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<LedgerState>(&bytes) {
                Ok(state) => {
                    debug!(table, parts = state.parts.len(), "Loaded part ledger");
                    state
                }
                Err(e) => {
                    warn!(table, error = %e, "Failed to parse part ledger, starting fresh");
                    fresh
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => fresh,
            Err(source) => return Err(StateError::ReadState { path, source }),
        };

        Ok(Self { path, state })
    }

    /// Load a ledger file strictly, failing on parse errors.
    pub fn load_strict(path: &Path) -> Result<LedgerState, StateError> {
        let bytes = std::fs::read(path).context(ReadStateSnafu { path })?;
        serde_json::from_slice(&bytes).context(ParseStateSnafu { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn status(&self, part: &str) -> Option<PartStatus> {
        self.state.parts.get(part).copied()
    }

    /// Move `part` forward to `status`. Returns whether anything changed.
    pub fn advance(&mut self, part: &str, status: PartStatus) -> bool {
        match self.state.parts.get_mut(part) {
            Some(current) if *current >= status => false,
            Some(current) => {
                *current = status;
                true
            }
            None => {
                self.state.parts.insert(part.to_string(), status);
                true
            }
        }
    }

    /// Advance every part to `status`, keyed by any part name (raw or sanitized).
    pub fn advance_all<I, S>(&mut self, names: I, status: PartStatus) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| raw_name(name.as_ref()))
            .filter(|id| self.advance(id, status))
            .count()
    }

    /// Advance every known part that is at least `from` to `status`.
    pub fn advance_known(&mut self, from: PartStatus, status: PartStatus) -> usize {
        let ids: Vec<String> = self
            .state
            .parts
            .iter()
            .filter(|(_, s)| **s >= from)
            .map(|(id, _)| id.clone())
            .collect();
        self.advance_all(ids, status)
    }

    /// Rebuild statuses from the part directory and the staged object names.
    ///
    /// Only ever moves parts forward, so a `Loaded` part stays loaded.
    pub fn reconcile(
        &mut self,
        table: &Table,
        staged: &BTreeSet<String>,
    ) -> std::io::Result<usize> {
        let raw = part::names(&table.extracted_files()?);
        let sanitized = part::names(&table.transform_files()?);

        let mut changed = self.advance_all(&raw, PartStatus::Extracted);
        changed += self.advance_all(&sanitized, PartStatus::Sanitized);
        changed += self.advance_all(staged, PartStatus::Staged);
        Ok(changed)
    }

    /// Persist the ledger with an atomic temp-file rename.
    pub fn save(&mut self) -> Result<(), StateError> {
        self.state.last_update_ts = chrono::Utc::now().timestamp();
        let json = serde_json::to_vec_pretty(&self.state).context(SerializeStateSnafu)?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).context(WriteStateSnafu { path: dir })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).context(WriteStateSnafu { path: &tmp })?;
        std::fs::rename(&tmp, &self.path).context(WriteStateSnafu { path: &self.path })?;

        debug!(
            table = %self.state.table,
            parts = self.state.parts.len(),
            "Saved part ledger"
        );
        Ok(())
    }
}

/// Exclusive lock on a table's part directory, released on drop.
#[derive(Debug)]
pub struct TableLock {
    path: PathBuf,
}

impl TableLock {
    /// Acquire the lock for `dir`, creating the directory if needed.
    ///
    /// Fails with `TableLocked` if another run holds it.
    pub fn acquire(dir: &Path) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir).context(CreateLockSnafu { path: dir })?;
        let path = dir.join(LOCK_FILE);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return TableLockedSnafu { path }.fail();
            }
            Err(source) => return Err(StateError::CreateLock { path, source }),
        };

        // Holder pid for operators clearing a stale lock by hand.
        if let Err(e) = writeln!(file, "{}", std::process::id()) {
            debug!(path = %path.display(), error = %e, "Failed to record pid in lock file");
        }

        info!(path = %path.display(), "Acquired table lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released table lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release table lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::config_for;
    use tempfile::TempDir;

    #[test]
    fn test_status_only_moves_forward() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::open(dir.path(), "publication").unwrap();

        assert!(ledger.advance("part-0.json.gz", PartStatus::Staged));
        assert!(!ledger.advance("part-0.json.gz", PartStatus::Extracted));
        assert!(!ledger.advance("part-0.json.gz", PartStatus::Staged));
        assert!(ledger.advance("part-0.json.gz", PartStatus::Loaded));
        assert_eq!(ledger.status("part-0.json.gz"), Some(PartStatus::Loaded));
        assert_eq!(ledger.status("part-1.json.gz"), None);
    }

    #[test]
    fn test_status_ordering() {
        assert!(PartStatus::Extracted < PartStatus::Sanitized);
        assert!(PartStatus::Sanitized < PartStatus::Staged);
        assert!(PartStatus::Staged < PartStatus::Loaded);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::open(dir.path(), "publication").unwrap();
        ledger.advance_all(["part-0_NR.json.gz", "part-1.json.gz"], PartStatus::Sanitized);
        ledger.save().unwrap();

        assert!(dir.path().join(STATE_FILE).exists());
        assert!(!dir.path().join("_openaire_state.json.tmp").exists());

        let reopened = Ledger::open(dir.path(), "publication").unwrap();
        assert_eq!(reopened.state().parts, ledger.state().parts);
        assert_eq!(
            reopened.status("part-0.json.gz"),
            Some(PartStatus::Sanitized)
        );

        let strict = Ledger::load_strict(ledger.path()).unwrap();
        assert_eq!(strict.table, "publication");
        assert_eq!(strict.schema_version, 1);
    }

    #[test]
    fn test_corrupt_ledger_starts_fresh() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), b"{not json").unwrap();

        let ledger = Ledger::open(dir.path(), "publication").unwrap();
        assert!(ledger.state().parts.is_empty());
        assert!(matches!(
            Ledger::load_strict(ledger.path()),
            Err(StateError::ParseState { .. })
        ));
    }

    #[test]
    fn test_reconcile_from_disk_and_remote() {
        let dir = TempDir::new().unwrap();
        let config = config_for(
            dir.path(),
            "    publication:\n      num_parts: 1\n      remove_nulls: source\n",
        );
        let table = Table::from_config(&config).unwrap().remove(0);
        std::fs::create_dir_all(&table.part_location).unwrap();
        for name in [
            "part-0.json.gz",
            "part-1.json.gz",
            "part-2.json.gz",
            "part-0_NR.json.gz",
            "part-1_NR.json.gz",
        ] {
            std::fs::write(table.part_location.join(name), b"").unwrap();
        }
        let staged: BTreeSet<String> = ["part-0_NR.json.gz".to_string()].into();

        let mut ledger = Ledger::open(&table.part_location, &table.name).unwrap();
        ledger.reconcile(&table, &staged).unwrap();

        assert_eq!(ledger.status("part-0.json.gz"), Some(PartStatus::Staged));
        assert_eq!(ledger.status("part-1.json.gz"), Some(PartStatus::Sanitized));
        assert_eq!(ledger.status("part-2.json.gz"), Some(PartStatus::Extracted));


        // reconciling again changes nothing
        assert_eq!(ledger.reconcile(&table, &staged).unwrap(), 0);
    }

    #[test]
    fn test_advance_known_marks_loaded() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::open(dir.path(), "relation").unwrap();
        ledger.advance("a.json.gz", PartStatus::Staged);
        ledger.advance("b.json.gz", PartStatus::Extracted);

        assert_eq!(
            ledger.advance_known(PartStatus::Staged, PartStatus::Loaded),
            1
        );
        assert_eq!(ledger.status("a.json.gz"), Some(PartStatus::Loaded));
        assert_eq!(ledger.status("b.json.gz"), Some(PartStatus::Extracted));
    }

    #[test]
    fn test_second_lock_fails_until_first_drops() {
        let dir = TempDir::new().unwrap();
        let table_dir = dir.path().join("publication");

        let first = TableLock::acquire(&table_dir).unwrap();
        assert!(first.path().exists());

        let err = TableLock::acquire(&table_dir).unwrap_err();
        assert!(matches!(err, StateError::TableLocked { .. }));

        drop(first);
        assert!(!table_dir.join(LOCK_FILE).exists());
        let _second = TableLock::acquire(&table_dir).unwrap();
    }
}
