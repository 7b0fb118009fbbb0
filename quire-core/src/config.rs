//! Configuration for quire

use crate::QuireError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# Quire Configuration

[history]
# Index database file name, created inside the history directory
index_file = "history.db"

[session]
# Quiet period after the last edit before an auto-save runs (e.g., "750ms", "2s")
autosave_debounce = "750ms"

[index]
# SQLite serializes writers, so 1 or 2 connections is all the pool needs
max_connections = 2

[sync]
# Allowed difference between file size and indexed character count
size_tolerance = 100
# Allowed difference between file mtime and indexed update time
time_tolerance = "1s"

[search]
# Delimiters wrapped around each highlighted match
highlight_open = "<<"
highlight_close = ">>"
"#;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(750);
const DEFAULT_TIME_TOLERANCE: Duration = Duration::from_secs(1);

/// Quire configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_autosave_debounce")]
    pub autosave_debounce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: u64,
    #[serde(default = "default_time_tolerance")]
    pub time_tolerance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_highlight_open")]
    pub highlight_open: String,
    #[serde(default = "default_highlight_close")]
    pub highlight_close: String,
}

// Default value functions
fn default_index_file() -> String {
    "history.db".to_string()
}
fn default_autosave_debounce() -> String {
    "750ms".to_string()
}
fn default_max_connections() -> u32 {
    2
}
fn default_size_tolerance() -> u64 {
    100
}
fn default_time_tolerance() -> String {
    "1s".to_string()
}
fn default_highlight_open() -> String {
    "<<".to_string()
}
fn default_highlight_close() -> String {
    ">>".to_string()
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_debounce: default_autosave_debounce(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            size_tolerance: default_size_tolerance(),
            time_tolerance: default_time_tolerance(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            highlight_open: default_highlight_open(),
            highlight_close: default_highlight_close(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| QuireError::ConfigParse(e.to_string()))
    }

    /// Get the auto-save debounce as Duration
    pub fn autosave_debounce(&self) -> Duration {
        parse_duration(&self.session.autosave_debounce).unwrap_or(DEFAULT_DEBOUNCE)
    }

    /// Get the drift time tolerance as Duration
    pub fn time_tolerance(&self) -> Duration {
        parse_duration(&self.sync.time_tolerance).unwrap_or(DEFAULT_TIME_TOLERANCE)
    }

    /// Pool size, clamped to the 1..=2 connections a single-writer store needs
    pub fn max_connections(&self) -> u32 {
        self.index.max_connections.clamp(1, 2)
    }
}

/// Parse duration string (e.g., "750ms", "30s", "5m", "1h", "1d")
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num_str) = s.strip_suffix("ms") {
        return num_str.trim().parse().ok().map(Duration::from_millis);
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.trim().parse().ok()?;

    match unit {
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        "d" => Some(Duration::from_secs(num * 86400)),
        _ => None,
    }
}
