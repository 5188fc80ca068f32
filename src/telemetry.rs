use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, FromRow)]
pub struct SampleRow {
    pub captured_at: DateTime<Utc>,
    pub production_count: Option<i64>,
}

/// What a telemetry window says about a machine. `has_production` is true
/// when any sample's counter exceeds the first counter observed in the
/// window; counterless samples still advance `last_seen_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProductionSignal {
    pub has_production: bool,
    pub first_count: Option<i64>,
    pub last_count: Option<i64>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

pub async fn query_recent(
    pool: &PgPool,
    device_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<SampleRow>> {
    let rows: Vec<SampleRow> = sqlx::query_as(
        r#"
        SELECT captured_at, production_count
        FROM telemetry_samples
        WHERE device_id = $1
          AND captured_at >= $2
        ORDER BY captured_at ASC
        "#,
    )
    .bind(device_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Scans a window of samples (oldest first) for a production signal.
pub fn scan_window(samples: &[SampleRow]) -> ProductionSignal {
    let mut signal = ProductionSignal::default();

    for sample in samples {
        signal.last_seen_at = Some(sample.captured_at);
        let Some(count) = sample.production_count else {
            continue;
        };
        match signal.first_count {
            None => signal.first_count = Some(count),
            Some(baseline) => {
                if count > baseline {
                    signal.has_production = true;
                }
            }
        }
        signal.last_count = Some(count);
    }

    signal
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(minute: u32, count: Option<i64>) -> SampleRow {
        SampleRow {
            captured_at: Utc.with_ymd_and_hms(2026, 5, 20, 10, minute, 0).unwrap(),
            production_count: count,
        }
    }

    #[test]
    fn increasing_counter_means_production() {
        let signal = scan_window(&[sample(0, Some(120)), sample(1, Some(120)), sample(2, Some(121))]);
        assert!(signal.has_production);
        assert_eq!(signal.first_count, Some(120));
        assert_eq!(signal.last_count, Some(121));
    }

    #[test]
    fn unchanged_counter_is_not_production() {
        let signal = scan_window(&[sample(0, Some(120)), sample(1, Some(120)), sample(2, Some(120))]);
        assert!(!signal.has_production);
    }

    #[test]
    fn counter_reset_is_not_production() {
        // A decreasing counter (device reboot) must not read as output.
        let signal = scan_window(&[sample(0, Some(500)), sample(1, Some(3))]);
        assert!(!signal.has_production);
        assert_eq!(signal.last_count, Some(3));
    }

    #[test]
    fn counterless_samples_are_skipped_but_update_last_seen() {
        let signal = scan_window(&[sample(0, Some(42)), sample(1, None), sample(2, Some(43))]);
        assert!(signal.has_production);
        assert_eq!(
            signal.last_seen_at,
            Some(Utc.with_ymd_and_hms(2026, 5, 20, 10, 2, 0).unwrap())
        );
    }

    #[test]
    fn empty_window_yields_no_signal() {
        let signal = scan_window(&[]);
        assert!(!signal.has_production);
        assert_eq!(signal.last_seen_at, None);
    }
}
