//! Database query modules, one per table.
//!
//! Every function takes the owning user's id explicitly; no query reads or
//! writes another user's rows.

pub mod consents;
pub mod deleted_ids;
pub mod faqs;
pub mod message_log;
pub mod messages;
pub mod reply_patterns;
pub mod users;

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp for storage.
///
/// Fixed-width UTC so that text comparison in SQL matches time order.
pub(crate) fn to_db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored timestamp, falling back to now for unreadable values.
pub(crate) fn from_db_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parses an optional stored timestamp.
pub(crate) fn from_db_time_opt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().map(from_db_time)
}

/// `(?, ?, ...)` placeholder list for `IN` clauses.
pub(crate) fn placeholders(count: usize) -> String {
    let marks = vec!["?"; count.max(1)].join(", ");
    format!("({marks})")
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn db_time_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        let (sa, sb) = (to_db_time(&a), to_db_time(&b));
        assert_eq!(sa, "2025-01-01T09:00:00.000Z");
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(from_db_time(&sb), b);
    }

    #[test]
    fn unreadable_time_falls_back_to_now() {
        let before = Utc::now();
        assert!(from_db_time("yesterday") >= before);
    }

    #[test]
    fn placeholder_list() {
        assert_eq!(placeholders(3), "(?, ?, ?)");
        assert_eq!(placeholders(0), "(?)");
    }
}
