use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Calendar date of `instant` as observed in `tz`.
pub fn local_date_of(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// The instant of local midnight that ends `local_date` in `tz`, i.e. the
/// start of the following local day.
///
/// Midnight is not guaranteed to exist or be unique: some zones run their
/// DST transitions at 00:00. An ambiguous midnight resolves to the earlier
/// instance; a nonexistent midnight resolves to the first valid local time
/// after it.
pub fn day_end_boundary(local_date: NaiveDate, tz: Tz) -> Result<DateTime<Utc>> {
    let next_day = local_date
        .succ_opt()
        .ok_or_else(|| anyhow!("local date {local_date} has no successor"))?;
    let midnight = next_day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("failed to build midnight for {next_day}"))?;
    resolve_local(&tz, midnight)
        .ok_or_else(|| anyhow!("no valid instant near local midnight {midnight} in {tz}"))
}

/// Elapsed time between two instants expressed in fractional hours,
/// clamped at zero.
pub fn duration_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds();
    if millis <= 0 {
        return 0.0;
    }
    millis as f64 / 3_600_000.0
}

fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    const SEARCH_MINUTES: i64 = 180;

    for minutes in 0..=SEARCH_MINUTES {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(a, b) => {
                let (a, b) = (a.with_timezone(&Utc), b.with_timezone(&Utc));
                return Some(if a <= b { a } else { b });
            }
            chrono::LocalResult::None => continue,
        }
    }
    None
}
