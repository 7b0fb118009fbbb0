//! Canonical markdown file storage, one file per composition

use crate::timestamp;
use crate::QuireError;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Extension of composition files; anything else in the directory is ignored.
pub const COMPOSITION_EXTENSION: &str = "md";

/// Upper bound on `-N` suffixes tried when several compositions share a second.
pub(crate) const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Directory of composition files. Knows nothing about the index.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Open the history directory, creating it if needed
    pub fn open(dir: &Path) -> crate::Result<Self> {
        fs::create_dir_all(dir).map_err(|e| QuireError::storage(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a new composition file named after the current time.
    ///
    /// Names are claimed with exclusive create, so a second composition in
    /// the same second gets a `-1`, `-2`, ... suffix instead of overwriting.
    pub fn create(&self, working_dir: &str, content: &str) -> crate::Result<PathBuf> {
        let stamp = timestamp::file_stamp(timestamp::now())?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stamp}.{COMPOSITION_EXTENSION}")
            } else {
                format!("{stamp}-{attempt}.{COMPOSITION_EXTENSION}")
            };
            let path = self.dir.join(name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(QuireError::storage(path, e)),
            };

            if let Err(e) = file.write_all(content.as_bytes()) {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&path) {
                    warn!(file_path = %path.display(), error = %cleanup, "Failed to remove partial history file");
                }
                return Err(QuireError::storage(path, e));
            }

            info!(
                file_path = %path.display(),
                working_directory = working_dir,
                content_length = content.len(),
                "History file created"
            );
            return Ok(path);
        }

        Err(QuireError::storage(
            &self.dir,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free file name for timestamp {stamp}"),
            ),
        ))
    }

    pub fn read(&self, path: &Path) -> crate::Result<String> {
        debug!(file_path = %path.display(), "Reading history file");
        fs::read_to_string(path).map_err(|e| QuireError::storage(path, e))
    }

    /// Replace a composition's content.
    ///
    /// The new bytes land in a hidden sibling first and are renamed over the
    /// original, so readers never observe a half-written file.
    pub fn update(&self, path: &Path, content: &str) -> crate::Result<()> {
        debug!(file_path = %path.display(), content_length = content.len(), "Updating history file");

        let tmp_path = temp_sibling(path);
        if let Err(e) = fs::write(&tmp_path, content) {
            let _ = fs::remove_file(&tmp_path);
            return Err(QuireError::storage(path, e));
        }
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(QuireError::storage(path, e));
        }
        Ok(())
    }

    pub fn delete(&self, path: &Path) -> crate::Result<()> {
        fs::remove_file(path).map_err(|e| QuireError::storage(path, e))?;
        info!(file_path = %path.display(), "History file deleted");
        Ok(())
    }

    /// All composition files, newest modification time first.
    pub fn list(&self) -> crate::Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| QuireError::storage(&self.dir, e))?;

        let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QuireError::storage(&self.dir, e))?;
            let path = entry.path();
            if !is_composition_file(&path) {
                continue;
            }

            let modified = entry
                .metadata()
                .and_then(|meta| {
                    if meta.is_file() {
                        meta.modified().map(Some)
                    } else {
                        Ok(None)
                    }
                });
            match modified {
                Ok(Some(mtime)) => files.push((path, mtime)),
                Ok(None) => {}
                Err(e) => {
                    warn!(file_path = %path.display(), error = %e, "Skipping unreadable history file");
                }
            }
        }

        files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        debug!(count = files.len(), "Found history files");
        Ok(files.into_iter().map(|(path, _)| path).collect())
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub fn mod_time(&self, path: &Path) -> crate::Result<OffsetDateTime> {
        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(|e| QuireError::storage(path, e))?;
        Ok(timestamp::from_system_time(modified))
    }

    /// Size in bytes
    pub fn size(&self, path: &Path) -> crate::Result<u64> {
        fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|e| QuireError::storage(path, e))
    }
}

fn is_composition_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == COMPOSITION_EXTENSION)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(&dir.path().join("history")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_and_read() {
        let (_dir, store) = setup();
        let path = store.create("/tmp/proj", "hello\nworld").unwrap();

        assert!(store.exists(&path));
        assert_eq!(path.extension().unwrap(), "md");
        assert_eq!(store.read(&path).unwrap(), "hello\nworld");
        assert_eq!(store.size(&path).unwrap(), 11);
    }

    #[test]
    fn test_same_second_creates_do_not_collide() {
        let (_dir, store) = setup();
        let paths: Vec<PathBuf> = (0..5)
            .map(|i| store.create("/tmp", &format!("draft {i}")).unwrap())
            .collect();

        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), 5);
        for (i, path) in paths.iter().enumerate() {
            assert_eq!(store.read(path).unwrap(), format!("draft {i}"));
        }
    }

    #[test]
    fn test_update_replaces_content_without_leftovers() {
        let (_dir, store) = setup();
        let path = store.create("/tmp", "first").unwrap();
        store.update(&path, "second").unwrap();

        assert_eq!(store.read(&path).unwrap(), "second");
        let names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1, "temporary file left behind: {names:?}");
    }

    #[test]
    fn test_delete_missing_file_is_storage_error() {
        let (_dir, store) = setup();
        let path = store.dir().join("nope.md");
        let err = store.delete(&path).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("nope.md"));
    }

    #[test]
    fn test_list_filters_and_orders_newest_first() {
        let (_dir, store) = setup();
        let older = store.create("/tmp", "older").unwrap();
        thread::sleep(Duration::from_millis(20));
        let newer = store.create("/tmp", "newer").unwrap();
        fs::write(store.dir().join("history.db"), b"not markdown").unwrap();
        fs::write(store.dir().join("notes.txt"), b"ignored").unwrap();
        fs::create_dir(store.dir().join("nested.md")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![newer, older]);
    }

    #[test]
    fn test_mod_time_of_missing_file() {
        let (_dir, store) = setup();
        assert!(store.mod_time(&store.dir().join("missing.md")).is_err());
        assert!(!store.exists(&store.dir().join("missing.md")));
    }
}
