//! Composition records as mirrored in the index

use serde::Serialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// One composition: the file is authoritative for `content`, this struct is
/// what the index knows about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Composition {
    /// Index row id (0 until inserted)
    pub id: i64,
    pub file_path: PathBuf,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub working_directory: String,
    pub content: String,
    /// UTF-8 byte length of `content`
    pub character_count: u64,
    pub line_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Composition {
    /// Build a record for a freshly written file; created and updated share `at`.
    pub fn new(file_path: &Path, working_directory: &str, content: &str, at: OffsetDateTime) -> Self {
        Self {
            id: 0,
            file_path: file_path.to_path_buf(),
            created_at: at,
            working_directory: working_directory.to_string(),
            content: content.to_string(),
            character_count: character_count(content),
            line_count: line_count(content),
            updated_at: at,
        }
    }
}

/// New content for an existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpdate {
    pub content: String,
    pub character_count: u64,
    pub line_count: u64,
    pub updated_at: OffsetDateTime,
}

impl ContentUpdate {
    pub fn new(content: &str, updated_at: OffsetDateTime) -> Self {
        Self {
            content: content.to_string(),
            character_count: character_count(content),
            line_count: line_count(content),
            updated_at,
        }
    }
}

/// Byte length, comparable with the file size on disk.
pub fn character_count(content: &str) -> u64 {
    content.len() as u64
}

/// Number of `\n`, plus one when the last line is unterminated.
pub fn line_count(content: &str) -> u64 {
    let newlines = content.bytes().filter(|&b| b == b'\n').count() as u64;
    if !content.is_empty() && !content.ends_with('\n') {
        newlines + 1
    } else {
        newlines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_count() {
        assert_eq!(line_count(""), 0);
        assert_eq!(line_count("one"), 1);
        assert_eq!(line_count("one\n"), 1);
        assert_eq!(line_count("hello\nworld"), 2);
        assert_eq!(line_count("\n\n"), 2);
    }

    #[test]
    fn test_character_count_is_bytes() {
        assert_eq!(character_count("hello\nworld"), 11);
        assert_eq!(character_count("héllo"), 6);
    }

    #[test]
    fn test_new_composition_metrics() {
        let at = OffsetDateTime::from_unix_timestamp(1_760_000_000).unwrap();
        let record = Composition::new(Path::new("/h/a.md"), "/tmp/proj", "hello\nworld", at);
        assert_eq!(record.character_count, 11);
        assert_eq!(record.line_count, 2);
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(record.id, 0);
    }
}
