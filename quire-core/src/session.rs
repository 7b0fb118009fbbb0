//! Composition lifecycle and debounced auto-save
//!
//! [`SessionManager`] is the only surface editor code talks to. It keeps
//! the file and the index row of the active composition in step: files are
//! written first and always win, index trouble during a save is logged and
//! healed where possible.
//!
//! Auto-save requests are debounced. Each request bumps a [`Generation`]
//! and arms a timer thread; arming a new one drops the previous timer's
//! cancel channel, which wakes and ends it. A timer that fires re-checks
//! its generation under the session lock before writing, so a request that
//! was superseded while the timer waited for the lock is discarded too.

use crate::config::Config;
use crate::generation::Generation;
use crate::index::SearchIndex;
use crate::query::{QueryEngine, SearchResult};
use crate::record::{Composition, ContentUpdate};
use crate::store::RecordStore;
use crate::sync::UNKNOWN_WORKING_DIRECTORY;
use crate::timestamp;
use crate::QuireError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct ActiveComposition {
    path: PathBuf,
    working_directory: String,
}

/// Content waiting for its debounce timer
struct PendingSave {
    generation: Generation,
    content: String,
    /// Dropping this wakes the timer thread and ends it
    _cancel: Sender<()>,
}

#[derive(Default)]
struct SessionState {
    current: Option<ActiveComposition>,
    pending: Option<PendingSave>,
    generation: Generation,
    completed_saves: u64,
}

struct SessionInner {
    store: RecordStore,
    index: Arc<SearchIndex>,
    query: QueryEngine,
    debounce: Duration,
    state: Mutex<SessionState>,
}

/// Owns the active composition and its auto-save timer
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(store: RecordStore, index: Arc<SearchIndex>, config: &Config) -> Self {
        let query = QueryEngine::new(Arc::clone(&index), &config.search);
        Self {
            inner: Arc::new(SessionInner {
                store,
                index,
                query,
                debounce: config.autosave_debounce(),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Write a new composition file and index it, making it the active one.
    ///
    /// If the index rejects the row the file is removed again, so a failed
    /// create leaves neither store changed.
    pub fn new_composition(&self, working_dir: &str, content: &str) -> crate::Result<PathBuf> {
        let mut state = self.inner.lock_state();
        self.inner.flush_pending(&mut state);

        let path = self.inner.store.create(working_dir, content)?;
        let at = self.inner.modified_or_now(&path);
        let record = Composition::new(&path, working_dir, content, at);

        if let Err(e) = self.inner.index.insert(&record) {
            warn!(file_path = %path.display(), error = %e, "Index insert failed, removing new history file");
            if let Err(cleanup) = self.inner.store.delete(&path) {
                warn!(file_path = %path.display(), error = %cleanup, "Failed to roll back history file");
            }
            return Err(e);
        }

        info!(file_path = %path.display(), working_directory = working_dir, "Composition created");
        state.current = Some(ActiveComposition {
            path: path.clone(),
            working_directory: working_dir.to_string(),
        });
        Ok(path)
    }

    /// Make `path` the active composition and return its file content
    pub fn load(&self, path: &Path) -> crate::Result<String> {
        let mut state = self.inner.lock_state();
        self.inner.flush_pending(&mut state);

        let content = self.inner.store.read(path)?;

        let working_directory = match self.inner.index.get_by_path(path) {
            Ok(Some(row)) => row.working_directory,
            Ok(None) => {
                warn!(file_path = %path.display(), "Loaded composition is not indexed");
                UNKNOWN_WORKING_DIRECTORY.to_string()
            }
            Err(e) => {
                warn!(file_path = %path.display(), error = %e, "Failed to read index entry for composition");
                UNKNOWN_WORKING_DIRECTORY.to_string()
            }
        };

        debug!(file_path = %path.display(), content_length = content.len(), "Composition loaded");
        state.current = Some(ActiveComposition {
            path: path.to_path_buf(),
            working_directory,
        });
        Ok(content)
    }

    /// Save the active composition now, cancelling any pending auto-save
    pub fn save(&self, content: &str) -> crate::Result<()> {
        let mut state = self.inner.lock_state();
        state.pending = None;
        self.inner.save_locked(&mut state, content)
    }

    /// Schedule a save of `content` after the debounce period.
    ///
    /// Does nothing without an active composition. Never blocks on I/O.
    pub fn trigger_auto_save(&self, content: &str) {
        let mut state = self.inner.lock_state();
        if state.current.is_none() {
            debug!("Auto-save requested with no active composition");
            return;
        }

        let generation = state.generation.next();
        state.generation = generation;

        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
        // replacing the pending save drops the old sender and stops its timer
        state.pending = Some(PendingSave {
            generation,
            content: content.to_string(),
            _cancel: cancel,
        });

        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        let spawned = thread::Builder::new()
            .name("quire-autosave".to_string())
            .spawn(move || run_timer(weak, cancelled, generation, debounce));

        match spawned {
            Ok(_) => debug!(generation = %generation, "Auto-save armed"),
            Err(e) => {
                warn!(error = %e, "Failed to start auto-save timer, save deferred to close");
            }
        }
    }

    /// Cancel the timer and write any pending edit synchronously
    pub fn close(&self, content: &str) -> crate::Result<()> {
        let mut state = self.inner.lock_state();
        if state.pending.take().is_some() {
            self.inner.save_locked(&mut state, content)?;
        }
        Ok(())
    }

    /// Delete a composition from both stores.
    ///
    /// Both deletes are attempted; the first failure is returned. Deleting
    /// the active composition clears it and drops its pending save.
    pub fn delete(&self, path: &Path) -> crate::Result<()> {
        let mut state = self.inner.lock_state();

        let index_result = self.inner.index.delete(path);
        if let Err(e) = &index_result {
            warn!(file_path = %path.display(), error = %e, "Failed to delete index entry");
        }
        let file_result = self.inner.store.delete(path);
        if let Err(e) = &file_result {
            warn!(file_path = %path.display(), error = %e, "Failed to delete history file");
        }

        if state.current.as_ref().is_some_and(|c| c.path == path) {
            state.current = None;
            state.pending = None;
        }

        index_result.map(|_| ()).and(file_result)
    }

    pub fn all_compositions(&self) -> crate::Result<Vec<Composition>> {
        self.inner.index.get_all()
    }

    pub fn compositions_by_directory(&self, working_dir: &str) -> crate::Result<Vec<Composition>> {
        self.inner.index.get_by_directory(working_dir)
    }

    pub fn compositions_by_date_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> crate::Result<Vec<Composition>> {
        self.inner.index.get_by_date_range(start, end)
    }

    pub fn search(&self, query: &str) -> crate::Result<Vec<SearchResult>> {
        self.inner.query.search(query)
    }

    /// Index record for `path`; `NotFound` when it is not indexed
    pub fn metadata(&self, path: &Path) -> crate::Result<Composition> {
        self.inner
            .index
            .get_by_path(path)?
            .ok_or_else(|| QuireError::NotFound(path.to_path_buf()))
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.inner.lock_state().current.as_ref().map(|c| c.path.clone())
    }

    pub fn working_directory(&self) -> Option<String> {
        self.inner
            .lock_state()
            .current
            .as_ref()
            .map(|c| c.working_directory.clone())
    }

    pub fn has_pending_save(&self) -> bool {
        self.inner.lock_state().pending.is_some()
    }

    /// Saves written since the session started, manual and automatic
    pub fn completed_saves(&self) -> u64 {
        self.inner.lock_state().completed_saves
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save_locked(&self, state: &mut SessionState, content: &str) -> crate::Result<()> {
        let current = state
            .current
            .clone()
            .ok_or(QuireError::NoActiveComposition)?;
        let path = &current.path;

        self.store.update(path, content)?;
        let at = self.modified_or_now(path);

        match self.index.update(path, &ContentUpdate::new(content, at)) {
            Ok(_) => {}
            Err(QuireError::NotFound(_)) => {
                warn!(file_path = %path.display(), "Index entry missing on save, re-inserting");
                let record = Composition::new(path, &current.working_directory, content, at);
                if let Err(e) = self.index.insert(&record) {
                    warn!(file_path = %path.display(), error = %e, "Failed to re-insert index entry");
                }
            }
            Err(e) => {
                warn!(file_path = %path.display(), error = %e, "Index update failed, history file saved");
            }
        }

        state.completed_saves += 1;
        debug!(file_path = %path.display(), content_length = content.len(), "Composition saved");
        Ok(())
    }

    /// Write out a pending auto-save before the active composition changes
    fn flush_pending(&self, state: &mut SessionState) {
        if let Some(pending) = state.pending.take() {
            if let Err(e) = self.save_locked(state, &pending.content) {
                warn!(error = %e, "Failed to flush pending auto-save");
            }
        }
    }

    fn fire(&self, generation: Generation) {
        let mut state = self.lock_state();
        let is_current = state
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == generation);
        if !is_current {
            debug!(generation = %generation, "Superseded auto-save discarded");
            return;
        }

        if let Some(pending) = state.pending.take() {
            if let Err(e) = self.save_locked(&mut state, &pending.content) {
                warn!(error = %e, "Auto-save failed");
            }
        }
    }

    fn modified_or_now(&self, path: &Path) -> OffsetDateTime {
        self.store.mod_time(path).unwrap_or_else(|e| {
            warn!(file_path = %path.display(), error = %e, "Could not stat history file, using current time");
            timestamp::now()
        })
    }
}

fn run_timer(
    session: Weak<SessionInner>,
    cancelled: Receiver<()>,
    generation: Generation,
    debounce: Duration,
) {
    match cancelled.recv_timeout(debounce) {
        Err(RecvTimeoutError::Timeout) => {}
        // sender dropped: superseded, saved, or the session is gone
        _ => return,
    }

    if let Some(session) = session.upgrade() {
        session.fire(generation);
    }
}
