//! Timestamp conversion utilities for PostgreSQL replication
//!
//! PostgreSQL counts microseconds from 2000-01-01 00:00:00 UTC, not from the
//! Unix epoch.

use crate::utils::binary::TimestampTz;
use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

// Seconds from Unix epoch (1970) to PostgreSQL epoch (2000)
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert SystemTime to microseconds since the PostgreSQL epoch.
///
/// Times before the Unix epoch are clamped to it.
pub fn system_time_to_postgres_timestamp(time: SystemTime) -> TimestampTz {
    let duration_since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();

    let unix_secs = duration_since_unix.as_secs() as i64;
    let unix_micros = unix_secs * 1_000_000 + (duration_since_unix.subsec_micros() as i64);

    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Convert a PostgreSQL timestamp to a UTC datetime, if representable
pub fn postgres_timestamp_to_datetime(ts: TimestampTz) -> Option<DateTime<Utc>> {
    let secs = ts.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let nsecs = (ts.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nsecs)
}

/// Format a PostgreSQL timestamp as "YYYY-MM-DD HH:MM:SS.sss UTC"
pub fn format_timestamp_from_pg(ts: TimestampTz) -> String {
    match postgres_timestamp_to_datetime(ts) {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("{}us", ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_postgres_epoch_is_zero() {
        let pg_epoch = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_OFFSET_SECS as u64);
        assert_eq!(system_time_to_postgres_timestamp(pg_epoch), 0);
    }

    #[test]
    fn test_timestamp_roundtrip_through_datetime() {
        let time = UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_456);
        let ts = system_time_to_postgres_timestamp(time);
        let datetime = postgres_timestamp_to_datetime(ts).unwrap();
        assert_eq!(datetime.timestamp_micros(), 1_700_000_000_123_456);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp_from_pg(0), "2000-01-01 00:00:00.000 UTC");
        assert_eq!(
            format_timestamp_from_pg(-1_000),
            "1999-12-31 23:59:59.999 UTC"
        );
    }
}
