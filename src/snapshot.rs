//! Versioned snapshot store for the integration workspace.
//!
//! A snapshot is an immutable full capture of the workspace file tree,
//! numbered monotonically. Version 0 is captured from the live workspace at
//! run start; every later version is produced by exactly one accepted merge.
//! Old versions are kept for the life of the run so stale patches can rebase.

use std::collections::BTreeMap;

use crate::errors::MergeError;

/// An immutable mapping of workspace-relative path to full file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    version: u64,
    files: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new(version: u64, files: BTreeMap<String, String>) -> Self {
        Self { version, files }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Append-only store of snapshots for one run.
#[derive(Debug)]
pub struct SnapshotStore {
    snapshots: Vec<Snapshot>,
}

impl SnapshotStore {
    /// Seed the store with version 0 captured from the live workspace.
    pub fn new(initial_files: BTreeMap<String, String>) -> Self {
        Self {
            snapshots: vec![Snapshot::new(0, initial_files)],
        }
    }

    pub fn current(&self) -> &Snapshot {
        self.snapshots
            .last()
            .expect("store always holds at least version 0")
    }

    pub fn current_version(&self) -> u64 {
        self.current().version()
    }

    pub fn get(&self, version: u64) -> Result<&Snapshot, MergeError> {
        self.snapshots
            .get(version as usize)
            .ok_or(MergeError::UnknownVersion { version })
    }

    /// Advance to the next version by merging `changed_files` over the current
    /// snapshot. Only the files touched by the accepted merge (and any
    /// heal-time edits) are re-read; everything else carries forward.
    pub fn advance(&mut self, changed_files: BTreeMap<String, String>) -> u64 {
        let mut files = self.current().files().clone();
        for (path, content) in changed_files {
            files.insert(path, content);
        }
        let version = self.current_version() + 1;
        self.snapshots.push(Snapshot::new(version, files));
        version
    }

    pub fn version_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_store_starts_at_version_zero() {
        let store = SnapshotStore::new(files(&[("src/App.tsx", "export {}")]));
        assert_eq!(store.current_version(), 0);
        assert_eq!(store.current().get("src/App.tsx"), Some("export {}"));
    }

    #[test]
    fn test_advance_is_monotonic_and_incremental() {
        let mut store = SnapshotStore::new(files(&[("a.ts", "1"), ("b.ts", "2")]));
        let v1 = store.advance(files(&[("b.ts", "2-changed")]));
        let v2 = store.advance(files(&[("c.ts", "new")]));

        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
        // Untouched file carried forward through both versions
        assert_eq!(store.current().get("a.ts"), Some("1"));
        assert_eq!(store.current().get("b.ts"), Some("2-changed"));
        assert_eq!(store.current().get("c.ts"), Some("new"));
    }

    #[test]
    fn test_old_versions_survive_for_rebase() {
        let mut store = SnapshotStore::new(files(&[("a.ts", "original")]));
        store.advance(files(&[("a.ts", "edited")]));

        assert_eq!(store.get(0).unwrap().get("a.ts"), Some("original"));
        assert_eq!(store.get(1).unwrap().get("a.ts"), Some("edited"));
        assert_eq!(store.version_count(), 2);
    }

    #[test]
    fn test_unknown_version_is_an_error() {
        let store = SnapshotStore::new(BTreeMap::new());
        let err = store.get(9).unwrap_err();
        assert!(err.to_string().contains('9'));
    }
}
