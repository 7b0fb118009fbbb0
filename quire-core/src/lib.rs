//! Quire Core - Composition history with a derived search index
//!
//! Compositions are stored one Markdown file each; the files are the
//! canonical record. A SQLite FTS5 index mirrors them for listing and
//! full-text search and can always be rebuilt from the files.

pub mod config;
pub mod error;
pub mod generation;
pub mod history;
pub mod index;
pub mod listing;
pub mod query;
pub mod record;
pub mod retention;
pub mod session;
pub mod store;
pub mod sync;
pub mod timestamp;

pub use config::Config;
pub use error::QuireError;
pub use generation::Generation;
pub use history::History;
pub use index::SearchIndex;
pub use listing::{ListOptions, Listing, SortBy};
pub use query::{Highlighter, QueryEngine, SearchMatch, SearchResult};
pub use record::{Composition, ContentUpdate};
pub use retention::{
    format_size, HistoryStatistics, RetentionManager, RetentionOutcome, RetentionPolicy,
    RetentionSelection,
};
pub use session::SessionManager;
pub use store::RecordStore;
pub use sync::{ConsistencyChecker, DriftMismatch, DriftReport, RebuildReport, SyncTolerance};

/// Result type alias for quire operations
pub type Result<T> = std::result::Result<T, QuireError>;
