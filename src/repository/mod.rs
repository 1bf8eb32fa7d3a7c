//! Repository layer for database persistence.
//!
//! All database access uses Diesel with sea-query rendered SQL.
//! Supports both SQLite and PostgreSQL backends.

pub mod job_config;
pub mod models;
#[cfg(feature = "postgres")]
pub mod pg_tls;
pub mod pool;
pub mod sea_tables;
pub mod util;

pub use job_config::{JobConfigRepository, DEFAULT_RUN_TABLE};
pub use pool::{DbPool, StoreError};
pub use util::{quote_identifier, redact_url_password};

use chrono::{DateTime, Utc};

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_datetime_opt() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            parse_datetime_opt(Some("2024-01-02T03:04:05+00:00".to_string())),
            Some(expected)
        );
        assert_eq!(parse_datetime_opt(Some("garbage".to_string())), None);
        assert_eq!(parse_datetime_opt(None), None);
    }
}
