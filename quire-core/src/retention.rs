//! Retention policies that delete compositions from both stores

use crate::index::SearchIndex;
use crate::record::Composition;
use crate::store::RecordStore;
use crate::timestamp;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Rule selecting compositions for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", content = "value", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Created strictly before now minus N days
    OlderThanDays(u32),
    /// Retain the N most recent, delete the rest
    KeepRecent(usize),
    /// Delete the N oldest
    DeleteOldest(usize),
    /// Exact match on working directory
    Directory(String),
    All,
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OlderThanDays(days) => write!(f, "older than {days} days"),
            Self::KeepRecent(n) => write!(f, "keep {n} most recent"),
            Self::DeleteOldest(n) => write!(f, "delete {n} oldest"),
            Self::Directory(dir) => write!(f, "directory {dir}"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Compositions a policy would delete. Computing one has no side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionSelection {
    pub policy: RetentionPolicy,
    pub compositions: Vec<Composition>,
    /// Sum of character counts
    pub total_size: u64,
}

impl RetentionSelection {
    fn new(policy: RetentionPolicy, compositions: Vec<Composition>) -> Self {
        let total_size = compositions.iter().map(|c| c.character_count).sum();
        Self {
            policy,
            compositions,
            total_size,
        }
    }

    pub fn count(&self) -> usize {
        self.compositions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compositions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionFailure {
    pub file_path: PathBuf,
    pub error: String,
}

/// What `apply` actually did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    pub selection: RetentionSelection,
    pub deleted: usize,
    pub failures: Vec<RetentionFailure>,
}

impl RetentionOutcome {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Aggregate view of the history, for deciding what to clean up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStatistics {
    pub total_compositions: usize,
    pub total_size: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub newest: Option<OffsetDateTime>,
    /// Whole days since the oldest composition was created
    pub age_days: Option<i64>,
    pub directory_counts: BTreeMap<String, usize>,
}

pub struct RetentionManager {
    store: RecordStore,
    index: Arc<SearchIndex>,
}

impl RetentionManager {
    pub fn new(store: RecordStore, index: Arc<SearchIndex>) -> Self {
        Self { store, index }
    }

    /// Preview which compositions `policy` selects
    pub fn evaluate(&self, policy: &RetentionPolicy) -> crate::Result<RetentionSelection> {
        self.evaluate_at(policy, timestamp::now())
    }

    /// Like `evaluate`, with age policies measured from `now`
    pub fn evaluate_at(
        &self,
        policy: &RetentionPolicy,
        now: OffsetDateTime,
    ) -> crate::Result<RetentionSelection> {
        let mut all = self.index.get_all()?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let selected: Vec<Composition> = match policy {
            RetentionPolicy::OlderThanDays(days) => {
                let cutoff = now - Duration::days(i64::from(*days));
                all.into_iter().filter(|c| c.created_at < cutoff).collect()
            }
            RetentionPolicy::KeepRecent(n) => all.into_iter().skip(*n).collect(),
            RetentionPolicy::DeleteOldest(n) => all.into_iter().rev().take(*n).collect(),
            RetentionPolicy::Directory(dir) => all
                .into_iter()
                .filter(|c| c.working_directory == *dir)
                .collect(),
            RetentionPolicy::All => all,
        };

        debug!(policy = %policy, selected = selected.len(), "Evaluated retention policy");
        Ok(RetentionSelection::new(policy.clone(), selected))
    }

    /// Delete everything `policy` selects, file first, then index row.
    ///
    /// A failure on one composition is recorded and the rest still run.
    pub fn apply(&self, policy: &RetentionPolicy) -> crate::Result<RetentionOutcome> {
        let selection = self.evaluate(policy)?;
        let mut deleted = 0;
        let mut failures = Vec::new();

        for composition in &selection.compositions {
            let path = &composition.file_path;

            match self.store.delete(path) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(file_path = %path.display(), "History file already gone");
                }
                Err(e) => {
                    warn!(file_path = %path.display(), error = %e, "Failed to delete history file");
                    failures.push(RetentionFailure {
                        file_path: path.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            }

            match self.index.delete(path) {
                Ok(_) => deleted += 1,
                Err(e) if e.is_not_found() => deleted += 1,
                Err(e) => {
                    warn!(file_path = %path.display(), error = %e, "Failed to delete index entry");
                    failures.push(RetentionFailure {
                        file_path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            policy = %policy,
            deleted,
            failed = failures.len(),
            "Retention policy applied"
        );
        Ok(RetentionOutcome {
            selection,
            deleted,
            failures,
        })
    }

    pub fn statistics(&self) -> crate::Result<HistoryStatistics> {
        self.statistics_at(timestamp::now())
    }

    pub fn statistics_at(&self, now: OffsetDateTime) -> crate::Result<HistoryStatistics> {
        let all = self.index.get_all()?;

        let mut stats = HistoryStatistics {
            total_compositions: all.len(),
            ..HistoryStatistics::default()
        };

        for composition in &all {
            stats.total_size += composition.character_count;
            *stats
                .directory_counts
                .entry(composition.working_directory.clone())
                .or_insert(0) += 1;
        }

        stats.oldest = all.iter().map(|c| c.created_at).min();
        stats.newest = all.iter().map(|c| c.created_at).max();
        stats.age_days = stats.oldest.map(|oldest| (now - oldest).whole_days());

        Ok(stats)
    }
}

/// Human-readable byte size, 1024-based with two decimals
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}
