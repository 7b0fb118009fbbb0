//! Opens a history directory and wires the components over it

use crate::config::Config;
use crate::index::SearchIndex;
use crate::listing::Listing;
use crate::query::QueryEngine;
use crate::retention::RetentionManager;
use crate::session::SessionManager;
use crate::store::RecordStore;
use crate::sync::{ConsistencyChecker, SyncTolerance};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A history directory: the composition files plus their index.
///
/// Components handed out here share one file store and one index pool.
pub struct History {
    store: RecordStore,
    index: Arc<SearchIndex>,
    config: Config,
}

impl History {
    /// Open (creating if needed) the history rooted at `dir`
    pub fn open(dir: &Path, config: &Config) -> crate::Result<Self> {
        let store = RecordStore::open(dir)?;
        let index_path = dir.join(&config.history.index_file);
        let index = Arc::new(SearchIndex::open(&index_path, config.max_connections())?);

        info!(dir = %dir.display(), index = %index_path.display(), "History opened");
        Ok(Self {
            store,
            index,
            config: config.clone(),
        })
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn index(&self) -> &Arc<SearchIndex> {
        &self.index
    }

    pub fn session(&self) -> SessionManager {
        SessionManager::new(self.store.clone(), Arc::clone(&self.index), &self.config)
    }

    pub fn checker(&self) -> ConsistencyChecker {
        ConsistencyChecker::new(
            self.store.clone(),
            Arc::clone(&self.index),
            SyncTolerance::from_config(&self.config),
        )
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.store.clone(), Arc::clone(&self.index))
    }

    pub fn listing(&self) -> Listing {
        Listing::new(Arc::clone(&self.index))
    }

    pub fn query(&self) -> QueryEngine {
        QueryEngine::new(Arc::clone(&self.index), &self.config.search)
    }
}
