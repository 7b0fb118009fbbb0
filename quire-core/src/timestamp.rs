//! Timestamp encoding shared by the file store and the index.
//!
//! Stored timestamps are RFC-3339 in UTC with a fixed nine-digit fraction,
//! so string order in SQLite matches chronological order and file
//! modification times survive a round trip exactly.

use crate::QuireError;
use std::time::SystemTime;
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const COLUMN_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
);

const FILE_STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");

/// Encode a timestamp for the `created_at` / `updated_at` columns.
pub fn format_timestamp(at: OffsetDateTime) -> crate::Result<String> {
    format_utc(at, COLUMN_FORMAT)
}

/// Parse any RFC-3339 timestamp, including ones written by older tools.
pub fn parse_timestamp(value: &str) -> crate::Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| QuireError::InvalidTimestamp {
        value: value.to_string(),
        message: e.to_string(),
    })
}

/// `YYYY-MM-DD_HH-MM-SS`, used for composition and backup file names.
pub fn file_stamp(at: OffsetDateTime) -> crate::Result<String> {
    format_utc(at, FILE_STAMP_FORMAT)
}

fn format_utc(at: OffsetDateTime, format: &[BorrowedFormatItem<'_>]) -> crate::Result<String> {
    let at = at.to_offset(UtcOffset::UTC);
    at.format(format).map_err(|e| QuireError::InvalidTimestamp {
        value: at.to_string(),
        message: e.to_string(),
    })
}

pub fn from_system_time(at: SystemTime) -> OffsetDateTime {
    OffsetDateTime::from(at)
}

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_round_trip_keeps_nanoseconds() {
        let at = OffsetDateTime::from_unix_timestamp_nanos(1_760_000_000_123_456_789).unwrap();
        let encoded = format_timestamp(at).unwrap();
        assert_eq!(encoded, "2025-10-09T08:53:20.123456789Z");
        assert_eq!(parse_timestamp(&encoded).unwrap(), at);
    }

    #[test]
    fn test_string_order_matches_time_order() {
        let base = OffsetDateTime::from_unix_timestamp(1_760_000_000).unwrap();
        let later = base + Duration::milliseconds(500);
        let much_later = base + Duration::seconds(1);
        let encode = |at| format_timestamp(at).unwrap();
        assert!(encode(base) < encode(later));
        assert!(encode(later) < encode(much_later));
    }

    #[test]
    fn test_parse_accepts_offsets() {
        let parsed = parse_timestamp("2025-10-09T10:53:20+02:00").unwrap();
        assert_eq!(format_timestamp(parsed).unwrap(), "2025-10-09T08:53:20.000000000Z");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, QuireError::InvalidTimestamp { .. }));
    }

    #[test]
    fn test_file_stamp() {
        let at = OffsetDateTime::from_unix_timestamp(1_760_000_000).unwrap();
        assert_eq!(file_stamp(at).unwrap(), "2025-10-09_08-53-20");
    }
}
