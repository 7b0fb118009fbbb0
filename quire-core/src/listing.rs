//! Sorted, filtered and paginated views over the index

use crate::index::SearchIndex;
use crate::record::Composition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

/// Ordering for history listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    /// Newest first
    #[default]
    Recent,
    Oldest,
    /// Alphabetical by working directory
    Directory,
    /// Largest first
    Size,
    /// Most lines first
    Lines,
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recent => "recent",
            Self::Oldest => "oldest",
            Self::Directory => "directory",
            Self::Size => "size",
            Self::Lines => "lines",
        };
        f.write_str(name)
    }
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recent" => Ok(Self::Recent),
            "oldest" => Ok(Self::Oldest),
            "directory" | "dir" => Ok(Self::Directory),
            "size" => Ok(Self::Size),
            "lines" => Ok(Self::Lines),
            other => Err(format!(
                "unknown sort order '{other}' (expected recent, oldest, directory, size or lines)"
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub sort_by: SortBy,
    /// Only this working directory
    pub working_dir: Option<String>,
    /// Maximum number of results (None = unlimited)
    pub limit: Option<usize>,
    /// Skip the first N results
    pub offset: usize,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort_by: SortBy) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

pub struct Listing {
    index: Arc<SearchIndex>,
}

impl Listing {
    pub fn new(index: Arc<SearchIndex>) -> Self {
        Self { index }
    }

    pub fn list(&self, options: &ListOptions) -> crate::Result<Vec<Composition>> {
        debug!(
            sort_by = %options.sort_by,
            working_dir = options.working_dir.as_deref().unwrap_or(""),
            limit = options.limit.unwrap_or(0),
            offset = options.offset,
            "Listing compositions"
        );

        let mut compositions = match &options.working_dir {
            Some(dir) => self.index.get_by_directory(dir)?,
            None => self.index.get_all()?,
        };
        sort_compositions(&mut compositions, options.sort_by);

        let page: Vec<Composition> = compositions
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();

        debug!(count = page.len(), "Listed compositions");
        Ok(page)
    }

    /// The `limit` most recent compositions
    pub fn recent(&self, limit: usize) -> crate::Result<Vec<Composition>> {
        self.list(&ListOptions::new().with_limit(limit))
    }

    /// Every working directory seen, alphabetically
    pub fn unique_directories(&self) -> crate::Result<Vec<String>> {
        let dirs: BTreeSet<String> = self
            .index
            .get_all()?
            .into_iter()
            .map(|c| c.working_directory)
            .collect();
        Ok(dirs.into_iter().collect())
    }

    pub fn count(&self) -> crate::Result<usize> {
        self.index.count()
    }

    pub fn count_in_directory(&self, working_dir: &str) -> crate::Result<usize> {
        Ok(self.index.get_by_directory(working_dir)?.len())
    }

    /// Sum of character counts
    pub fn total_size(&self) -> crate::Result<u64> {
        Ok(self.index.get_all()?.iter().map(|c| c.character_count).sum())
    }

    /// Earliest and latest creation times, if there is any history
    pub fn date_range(&self) -> crate::Result<Option<(OffsetDateTime, OffsetDateTime)>> {
        let all = self.index.get_all()?;
        let earliest = all.iter().map(|c| c.created_at).min();
        let latest = all.iter().map(|c| c.created_at).max();
        Ok(earliest.zip(latest))
    }
}

fn sort_compositions(compositions: &mut [Composition], sort_by: SortBy) {
    match sort_by {
        SortBy::Recent => compositions.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
        }),
        SortBy::Oldest => compositions.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        }),
        SortBy::Directory => {
            compositions.sort_by(|a, b| a.working_directory.cmp(&b.working_directory))
        }
        SortBy::Size => compositions.sort_by(|a, b| b.character_count.cmp(&a.character_count)),
        SortBy::Lines => compositions.sort_by(|a, b| b.line_count.cmp(&a.line_count)),
    }
}
