//! Timestamp encoding and calendar helpers.
//!
//! Every timestamp persisted by medsync goes through [`to_sql`] so that the
//! stored text has a fixed width. Lexical comparison of two encoded values is
//! then the same as chronological comparison, which the queue and delta
//! queries rely on for `ORDER BY` and range filters.

use chrono::{
    DateTime, Local, LocalResult, NaiveTime, SecondsFormat, SubsecRound, TimeZone, Timelike, Utc,
};

/// Current time at storage precision.
///
/// Values taken from here compare equal after a round trip through the
/// database.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Encode a timestamp for storage.
#[must_use]
pub fn to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Encode an optional timestamp for storage.
#[must_use]
pub fn opt_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(to_sql)
}

/// Decode a stored timestamp.
///
/// Returns `None` if the text is not valid RFC 3339.
#[must_use]
pub fn from_sql(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// The most recent local midnight, expressed in UTC.
///
/// Used for "today" counters that reset at the device's local day boundary.
#[must_use]
pub fn local_midnight_utc(now: DateTime<Local>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&midnight) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
        // Midnight skipped by a DST jump: the day starts at the first valid instant.
        LocalResult::None => {
            let elapsed = i64::from(now.time().num_seconds_from_midnight());
            (now - chrono::Duration::seconds(elapsed)).with_timezone(&Utc)
        }
    }
}

/// Human readable age, e.g. "3 minutes ago".
#[must_use]
pub fn format_age(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(ts);
    if age.num_days() > 0 {
        format!("{} days ago", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{} hours ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{} minutes ago", age.num_minutes())
    } else {
        "just now".to_string()
    }
}
