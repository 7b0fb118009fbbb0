//! Drift detection between the composition files and the index, plus
//! rebuild and backup of the index.

use crate::config::Config;
use crate::index::SearchIndex;
use crate::record::{Composition, ContentUpdate};
use crate::store::{RecordStore, MAX_NAME_ATTEMPTS};
use crate::timestamp;
use crate::QuireError;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Working directory recorded for compositions recovered by `rebuild`
pub const UNKNOWN_WORKING_DIRECTORY: &str = "unknown";

/// How far a file and its index row may disagree before it counts as drift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTolerance {
    /// Bytes between file size and indexed character count
    pub size: u64,
    /// Between file modification time and indexed update time
    pub time: Duration,
}

impl SyncTolerance {
    pub fn from_config(config: &Config) -> Self {
        Self {
            size: config.sync.size_tolerance,
            time: config.time_tolerance(),
        }
    }
}

impl Default for SyncTolerance {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A file and its index row that disagree on size or timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftMismatch {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub indexed_size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub file_modified: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub indexed_updated: OffsetDateTime,
}

/// Result of comparing the file store with the index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Files with no index row
    pub missing_entries: Vec<PathBuf>,
    /// Index rows with no file
    pub missing_files: Vec<PathBuf>,
    pub mismatches: Vec<DriftMismatch>,
    pub total_files: usize,
    pub total_entries: usize,
}

impl DriftReport {
    pub fn is_synced(&self) -> bool {
        self.missing_entries.is_empty() && self.missing_files.is_empty() && self.mismatches.is_empty()
    }

    /// Turn any drift into `QuireError::Drift`
    pub fn into_result(self) -> crate::Result<Self> {
        if self.is_synced() {
            Ok(self)
        } else {
            Err(QuireError::Drift {
                missing_entries: self.missing_entries.len(),
                missing_files: self.missing_files.len(),
                mismatches: self.mismatches.len(),
            })
        }
    }
}

/// A file `rebuild` could not bring into the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildFailure {
    pub file_path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub files_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Index rows removed because their file is gone
    pub pruned: usize,
    pub failures: Vec<RebuildFailure>,
}

impl RebuildReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Compares and reconciles the two stores. The file store always wins.
pub struct ConsistencyChecker {
    store: RecordStore,
    index: Arc<SearchIndex>,
    tolerance: SyncTolerance,
}

impl ConsistencyChecker {
    pub fn new(store: RecordStore, index: Arc<SearchIndex>, tolerance: SyncTolerance) -> Self {
        Self {
            store,
            index,
            tolerance,
        }
    }

    pub fn tolerance(&self) -> SyncTolerance {
        self.tolerance
    }

    /// Report every disagreement between files and index rows. Read-only.
    pub fn verify(&self) -> crate::Result<DriftReport> {
        let files = self.store.list()?;
        let rows = self.index.get_all()?;

        let on_disk: BTreeSet<&Path> = files.iter().map(PathBuf::as_path).collect();
        let indexed: HashMap<&Path, &Composition> =
            rows.iter().map(|row| (row.file_path.as_path(), row)).collect();

        let mut report = DriftReport {
            total_files: files.len(),
            total_entries: rows.len(),
            ..DriftReport::default()
        };

        for path in &on_disk {
            let Some(row) = indexed.get(path) else {
                report.missing_entries.push(path.to_path_buf());
                continue;
            };

            let (file_size, file_modified) = match self.file_stats(path) {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(file_path = %path.display(), error = %e, "Skipping file during verify");
                    continue;
                }
            };

            let size_drift = file_size.abs_diff(row.character_count) > self.tolerance.size;
            let time_drift = (file_modified - row.updated_at)
                .whole_nanoseconds()
                .unsigned_abs()
                > self.tolerance.time.as_nanos();

            if size_drift || time_drift {
                report.mismatches.push(DriftMismatch {
                    file_path: path.to_path_buf(),
                    file_size,
                    indexed_size: row.character_count,
                    file_modified,
                    indexed_updated: row.updated_at,
                });
            }
        }

        report.missing_files = rows
            .iter()
            .filter(|row| !on_disk.contains(row.file_path.as_path()))
            .map(|row| row.file_path.clone())
            .collect();
        report.missing_files.sort();

        info!(
            files = report.total_files,
            entries = report.total_entries,
            missing_entries = report.missing_entries.len(),
            missing_files = report.missing_files.len(),
            mismatches = report.mismatches.len(),
            "History verification complete"
        );
        Ok(report)
    }

    /// Regenerate the index from the files.
    ///
    /// Individual files that cannot be read or written to the index are
    /// recorded in the report and skipped.
    pub fn rebuild(&self) -> crate::Result<RebuildReport> {
        info!(dir = %self.store.dir().display(), "Rebuilding history index");

        let files = self.store.list()?;
        let mut report = RebuildReport {
            files_seen: files.len(),
            ..RebuildReport::default()
        };

        for path in &files {
            match self.upsert(path) {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.updated += 1,
                Err(e) => {
                    warn!(file_path = %path.display(), error = %e, "Failed to rebuild index entry");
                    report.failures.push(RebuildFailure {
                        file_path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let on_disk: BTreeSet<&Path> = files.iter().map(PathBuf::as_path).collect();
        for row in self.index.get_all()? {
            if on_disk.contains(row.file_path.as_path()) {
                continue;
            }
            match self.index.delete(&row.file_path) {
                Ok(_) => report.pruned += 1,
                Err(e) => {
                    warn!(file_path = %row.file_path.display(), error = %e, "Failed to prune orphaned index entry");
                    report.failures.push(RebuildFailure {
                        file_path: row.file_path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.index.rebuild_fts()?;

        info!(
            files = report.files_seen,
            inserted = report.inserted,
            updated = report.updated,
            pruned = report.pruned,
            failed = report.failures.len(),
            "History index rebuilt"
        );
        Ok(report)
    }

    /// Copy the index database next to itself as `<file>.backup-<stamp>`.
    ///
    /// An existing backup is never overwritten; a second backup in the same
    /// second gets a `-1`, `-2`, ... suffix.
    pub fn backup(&self) -> crate::Result<PathBuf> {
        self.index.checkpoint()?;

        let source = self.index.path();
        let stamp = timestamp::file_stamp(timestamp::now())?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let mut name = source.as_os_str().to_owned();
            if attempt == 0 {
                name.push(format!(".backup-{stamp}"));
            } else {
                name.push(format!(".backup-{stamp}-{attempt}"));
            }
            let target = PathBuf::from(name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&target) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(QuireError::storage(target, e)),
            };

            let copied = File::open(source)
                .and_then(|mut reader| io::copy(&mut reader, &mut file))
                .and_then(|_| file.sync_all());
            if let Err(e) = copied {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&target) {
                    warn!(backup = %target.display(), error = %cleanup, "Failed to remove partial backup");
                }
                return Err(QuireError::storage(target, e));
            }

            info!(source = %source.display(), backup = %target.display(), "History index backed up");
            return Ok(target);
        }

        Err(QuireError::storage(
            source,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free backup name for timestamp {stamp}"),
            ),
        ))
    }

    /// Returns true when a new row was inserted
    fn upsert(&self, path: &Path) -> crate::Result<bool> {
        let content = self.store.read(path)?;
        let modified = self.store.mod_time(path)?;

        if self.index.exists(path)? {
            debug!(file_path = %path.display(), "Refreshing index entry");
            self.index.update(path, &ContentUpdate::new(&content, modified))?;
            Ok(false)
        } else {
            debug!(file_path = %path.display(), "Recovering unindexed file");
            let record = Composition::new(path, UNKNOWN_WORKING_DIRECTORY, &content, modified);
            self.index.insert(&record)?;
            Ok(true)
        }
    }

    fn file_stats(&self, path: &Path) -> crate::Result<(u64, OffsetDateTime)> {
        Ok((self.store.size(path)?, self.store.mod_time(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: RecordStore,
        index: Arc<SearchIndex>,
        checker: ConsistencyChecker,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(&dir.path().join("history")).unwrap();
        let index = Arc::new(SearchIndex::open(&store.dir().join("history.db"), 1).unwrap());
        let checker = ConsistencyChecker::new(store.clone(), Arc::clone(&index), SyncTolerance::default());
        Fixture {
            _dir: dir,
            store,
            index,
            checker,
        }
    }

    fn add_indexed(f: &Fixture, content: &str) -> PathBuf {
        let path = f.store.create("/tmp/proj", content).unwrap();
        let modified = f.store.mod_time(&path).unwrap();
        f.index
            .insert(&Composition::new(&path, "/tmp/proj", content, modified))
            .unwrap();
        path
    }

    #[test]
    fn test_consistent_store_is_synced() {
        let f = setup();
        add_indexed(&f, "one");
        add_indexed(&f, "two");

        let report = f.checker.verify().unwrap();
        assert!(report.is_synced(), "{report:?}");
        assert_eq!(report.total_files, 2);
        assert_eq!(report.total_entries, 2);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_detects_both_directions_of_drift() {
        let f = setup();
        let unindexed = f.store.create("/tmp", "no row").unwrap();
        let orphan = add_indexed(&f, "no file");
        fs::remove_file(&orphan).unwrap();

        let report = f.checker.verify().unwrap();
        assert_eq!(report.missing_entries, vec![unindexed]);
        assert_eq!(report.missing_files, vec![orphan]);
        assert!(report.mismatches.is_empty());

        let err = report.into_result().unwrap_err();
        assert!(matches!(
            err,
            QuireError::Drift {
                missing_entries: 1,
                missing_files: 1,
                mismatches: 0
            }
        ));
    }

    #[test]
    fn test_size_difference_within_tolerance_is_not_drift() {
        let f = setup();
        let path = add_indexed(&f, "short");
        fs::write(&path, "short plus a few bytes").unwrap();
        let modified = f.store.mod_time(&path).unwrap();
        f.index
            .update(&path, &ContentUpdate::new("short", modified))
            .unwrap();

        assert!(f.checker.verify().unwrap().mismatches.is_empty());
    }

    #[test]
    fn test_large_size_difference_is_a_mismatch() {
        let f = setup();
        let path = add_indexed(&f, "short");
        fs::write(&path, "x".repeat(500)).unwrap();
        let modified = f.store.mod_time(&path).unwrap();
        f.index
            .update(&path, &ContentUpdate::new("short", modified))
            .unwrap();

        let report = f.checker.verify().unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].file_size, 500);
        assert_eq!(report.mismatches[0].indexed_size, 5);
    }

    #[test]
    fn test_stale_timestamp_is_a_mismatch() {
        let f = setup();
        let path = add_indexed(&f, "content");
        let modified = f.store.mod_time(&path).unwrap();
        f.index
            .update(&path, &ContentUpdate::new("content", modified - time::Duration::hours(1)))
            .unwrap();

        let report = f.checker.verify().unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].file_modified, modified);
    }

    #[test]
    fn test_rebuild_converges() {
        let f = setup();
        let unindexed = f.store.create("/tmp", "recovered\ntext").unwrap();
        let stale = add_indexed(&f, "old");
        f.store.update(&stale, &"new ".repeat(100)).unwrap();
        let orphan = add_indexed(&f, "gone");
        fs::remove_file(&orphan).unwrap();

        let report = f.checker.rebuild().unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.files_seen, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.pruned, 1);

        assert!(f.checker.verify().unwrap().is_synced());

        let recovered = f.index.get_by_path(&unindexed).unwrap().unwrap();
        assert_eq!(recovered.working_directory, UNKNOWN_WORKING_DIRECTORY);
        assert_eq!(recovered.line_count, 2);
        assert_eq!(recovered.created_at, recovered.updated_at);
        assert_eq!(f.index.search("\"recovered\"").unwrap().len(), 1);
    }

    #[test]
    fn test_backup_copies_index() {
        let f = setup();
        add_indexed(&f, "backed up");

        let backup = f.checker.backup().unwrap();
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("history.db.backup-"), "{name}");
        assert_eq!(backup.parent(), f.index.path().parent());

        let copy = SearchIndex::open(&backup, 1).unwrap();
        assert_eq!(copy.count().unwrap(), 1);
    }

    #[test]
    fn test_repeated_backups_never_overwrite() {
        let f = setup();
        add_indexed(&f, "first");
        let first = f.checker.backup().unwrap();
        let first_len = fs::metadata(&first).unwrap().len();

        add_indexed(&f, "second");
        let second = f.checker.backup().unwrap();
        let third = f.checker.backup().unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(fs::metadata(&first).unwrap().len(), first_len);
        assert_eq!(SearchIndex::open(&first, 1).unwrap().count().unwrap(), 1);
        assert_eq!(SearchIndex::open(&third, 1).unwrap().count().unwrap(), 2);
    }
}
