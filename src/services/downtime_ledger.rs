use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::registry::{self, MachineRow};
use crate::time::{day_end_boundary, duration_hours, local_date_of};

pub const DEFAULT_REASON: &str = "Machine Status: DOWN";

#[derive(Debug, Clone, FromRow)]
pub struct DowntimeRow {
    pub id: i64,
    pub machine_id: Uuid,
    pub customer_id: Uuid,
    pub local_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub accumulated_hours: f64,
    pub is_active: bool,
    pub reason: String,
}

/// Folds the open segment `[segment_start, now]` into an accumulated total.
/// Callers reset `start_time = now` alongside, so repeated calls account for
/// exactly the delta since the previous call.
pub fn fold_hours(accumulated: f64, segment_start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    accumulated + duration_hours(segment_start, now)
}

/// Opens, extends, or reactivates the downtime record for the machine's
/// current local day.
///
/// Called on every DOWN tick. A missing record opens a fresh one; an active
/// record absorbs the elapsed delta; an inactive record from an earlier
/// stall the same local day is reactivated with its hours preserved so
/// multiple stalls in one day sum.
pub async fn start_downtime(
    pool: &PgPool,
    config: &MonitorConfig,
    machine: &MachineRow,
    now: DateTime<Utc>,
) -> Result<DowntimeRow> {
    // Timezone resolution happens before any write so a lookup failure
    // cannot leave a partial record behind.
    let tz = registry::customer_timezone(pool, machine.customer_id, config.default_tz()).await?;
    let local_date = local_date_of(now, tz);

    let existing: Option<DowntimeRow> = sqlx::query_as(
        r#"
        SELECT id, machine_id, customer_id, local_date, start_time, end_time,
               accumulated_hours, is_active, reason
        FROM downtimes
        WHERE machine_id = $1 AND local_date = $2
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(machine.id)
    .bind(local_date)
    .fetch_optional(pool)
    .await?;

    let row: DowntimeRow = match existing {
        None => {
            // The partial unique index on (machine_id, local_date) WHERE
            // is_active makes this insert race-free against the midnight
            // splitter's continuation insert for the same key.
            let inserted: Option<DowntimeRow> = sqlx::query_as(
                r#"
                INSERT INTO downtimes (
                    machine_id,
                    customer_id,
                    local_date,
                    start_time,
                    end_time,
                    accumulated_hours,
                    is_active,
                    reason
                )
                VALUES ($1, $2, $3, $4, NULL, 0, TRUE, $5)
                ON CONFLICT (machine_id, local_date) WHERE is_active DO NOTHING
                RETURNING id, machine_id, customer_id, local_date, start_time, end_time,
                          accumulated_hours, is_active, reason
                "#,
            )
            .bind(machine.id)
            .bind(machine.customer_id)
            .bind(local_date)
            .bind(now)
            .bind(DEFAULT_REASON)
            .fetch_optional(pool)
            .await?;

            match inserted {
                Some(row) => row,
                // Lost the insert to a concurrent continuation insert; the
                // winner's record is authoritative and the next tick
                // extends it.
                None => {
                    sqlx::query_as(
                        r#"
                        SELECT id, machine_id, customer_id, local_date, start_time, end_time,
                               accumulated_hours, is_active, reason
                        FROM downtimes
                        WHERE machine_id = $1 AND local_date = $2 AND is_active = TRUE
                        "#,
                    )
                    .bind(machine.id)
                    .bind(local_date)
                    .fetch_one(pool)
                    .await?
                }
            }
        }
        Some(active) if active.is_active => {
            let folded = fold_hours(active.accumulated_hours, active.start_time, now);
            sqlx::query_as(
                r#"
                UPDATE downtimes
                SET accumulated_hours = $2,
                    start_time = $3
                WHERE id = $1
                RETURNING id, machine_id, customer_id, local_date, start_time, end_time,
                          accumulated_hours, is_active, reason
                "#,
            )
            .bind(active.id)
            .bind(folded)
            .bind(now)
            .fetch_one(pool)
            .await?
        }
        Some(closed) => {
            sqlx::query_as(
                r#"
                UPDATE downtimes
                SET is_active = TRUE,
                    start_time = $2,
                    end_time = NULL
                WHERE id = $1
                RETURNING id, machine_id, customer_id, local_date, start_time, end_time,
                          accumulated_hours, is_active, reason
                "#,
            )
            .bind(closed.id)
            .bind(now)
            .fetch_one(pool)
            .await?
        }
    };

    Ok(row)
}

/// How to close the machine's open record, decided purely from the row and
/// the clock so the database writes follow one precomputed plan.
#[derive(Debug, PartialEq)]
pub(crate) enum ClosePlan {
    /// No active record: duplicate close, nothing to do.
    Noop,
    /// The record belongs to the current local day; close it at `now`.
    CloseToday { folded_hours: f64 },
    /// The record's local day has already ended (recovery landed between
    /// local midnight and the next boundary pass): close it at its own day
    /// boundary and book the remainder on the current day as an already
    /// closed segment, so no active record survives the recovery.
    CloseAcrossMidnight {
        boundary: DateTime<Utc>,
        closed_hours: f64,
        remainder_hours: f64,
    },
}

pub(crate) fn plan_close(
    open: Option<&DowntimeRow>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<ClosePlan> {
    let Some(open) = open else {
        return Ok(ClosePlan::Noop);
    };
    if open.local_date == local_date_of(now, tz) {
        return Ok(ClosePlan::CloseToday {
            folded_hours: fold_hours(open.accumulated_hours, open.start_time, now),
        });
    }
    let boundary = day_end_boundary(open.local_date, tz)?;
    Ok(ClosePlan::CloseAcrossMidnight {
        boundary,
        closed_hours: fold_hours(open.accumulated_hours, open.start_time, boundary),
        remainder_hours: fold_hours(0.0, boundary, now),
    })
}

/// Closes the machine's active downtime record. The lookup is date-free:
/// an open record dated the previous local day (stall straddling midnight,
/// recovery before the boundary pass) is closed at its day boundary with
/// the remainder booked to the current day. A missing active record is a
/// normal outcome (duplicate close), not an error.
pub async fn end_downtime(
    pool: &PgPool,
    config: &MonitorConfig,
    machine: &MachineRow,
    now: DateTime<Utc>,
) -> Result<Option<DowntimeRow>> {
    let tz = registry::customer_timezone(pool, machine.customer_id, config.default_tz()).await?;

    let active: Vec<DowntimeRow> = sqlx::query_as(
        r#"
        SELECT id, machine_id, customer_id, local_date, start_time, end_time,
               accumulated_hours, is_active, reason
        FROM downtimes
        WHERE machine_id = $1 AND is_active = TRUE
        ORDER BY id DESC
        "#,
    )
    .bind(machine.id)
    .fetch_all(pool)
    .await?;

    let Some(open) = active.first() else {
        return Ok(None);
    };

    let same_day = active
        .iter()
        .filter(|r| r.local_date == open.local_date)
        .count();
    if same_day > 1 {
        // Should be unreachable with keyed writes; surfaced for operators
        // rather than crashing the tick.
        tracing::error!(
            machine_id = %machine.id,
            local_date = %open.local_date,
            count = same_day,
            "multiple active downtime records for one machine-day"
        );
    }

    match plan_close(Some(open), tz, now)? {
        ClosePlan::Noop => Ok(None),
        ClosePlan::CloseToday { folded_hours } => {
            let row: DowntimeRow = sqlx::query_as(
                r#"
                UPDATE downtimes
                SET accumulated_hours = $2,
                    end_time = $3,
                    is_active = FALSE
                WHERE id = $1
                RETURNING id, machine_id, customer_id, local_date, start_time, end_time,
                          accumulated_hours, is_active, reason
                "#,
            )
            .bind(open.id)
            .bind(folded_hours)
            .bind(now)
            .fetch_one(pool)
            .await?;
            Ok(Some(row))
        }
        ClosePlan::CloseAcrossMidnight {
            boundary,
            closed_hours,
            remainder_hours,
        } => {
            let today = local_date_of(now, tz);

            let mut tx = pool.begin().await?;
            sqlx::query(
                r#"
                UPDATE downtimes
                SET accumulated_hours = $2,
                    end_time = $3,
                    is_active = FALSE
                WHERE id = $1
                "#,
            )
            .bind(open.id)
            .bind(closed_hours)
            .bind(boundary)
            .execute(&mut *tx)
            .await?;

            let row: DowntimeRow = sqlx::query_as(
                r#"
                INSERT INTO downtimes (
                    machine_id,
                    customer_id,
                    local_date,
                    start_time,
                    end_time,
                    accumulated_hours,
                    is_active,
                    reason
                )
                VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
                RETURNING id, machine_id, customer_id, local_date, start_time, end_time,
                          accumulated_hours, is_active, reason
                "#,
            )
            .bind(open.machine_id)
            .bind(open.customer_id)
            .bind(today)
            .bind(boundary)
            .bind(now)
            .bind(remainder_hours)
            .bind(&open.reason)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::debug!(
                machine_id = %machine.id,
                closed_date = %open.local_date,
                remainder_date = %today,
                "closed downtime across local midnight on recovery"
            );
            Ok(Some(row))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, h, m, s).unwrap()
    }

    #[test]
    fn repeated_folds_account_for_exactly_the_elapsed_wall_time() {
        // Five consecutive DOWN ticks one minute apart: each tick folds the
        // delta since the previous one and resets the segment start. The
        // total must equal the true elapsed time, with no double counting
        // and no gaps.
        let opened = at(10, 10, 0);
        let mut hours = 0.0;
        let mut segment_start = opened;
        for tick in 1..=5i64 {
            let now = opened + Duration::minutes(tick);
            hours = fold_hours(hours, segment_start, now);
            segment_start = now;
        }
        let expected = 5.0 / 60.0;
        assert!((hours - expected).abs() < 1e-9, "got {hours}");
    }

    #[test]
    fn close_after_extends_loses_nothing() {
        // Ticks extend at 10:11 and 10:12, recovery closes at 10:12:30.
        let mut hours = 0.0;
        let mut segment_start = at(10, 10, 0);
        for now in [at(10, 11, 0), at(10, 12, 0)] {
            hours = fold_hours(hours, segment_start, now);
            segment_start = now;
        }
        hours = fold_hours(hours, segment_start, at(10, 12, 30));
        let expected = duration_hours(at(10, 10, 0), at(10, 12, 30));
        assert!((hours - expected).abs() < 1e-9);
    }

    fn open_row(local_date: NaiveDate, start_time: DateTime<Utc>, accumulated: f64) -> DowntimeRow {
        DowntimeRow {
            id: 1,
            machine_id: Uuid::nil(),
            customer_id: Uuid::nil(),
            local_date,
            start_time,
            end_time: None,
            accumulated_hours: accumulated,
            is_active: true,
            reason: DEFAULT_REASON.to_string(),
        }
    }

    #[test]
    fn duplicate_close_plans_nothing() {
        let plan = plan_close(None, chrono_tz::Asia::Kolkata, at(10, 0, 0)).unwrap();
        assert_eq!(plan, ClosePlan::Noop);
    }

    #[test]
    fn same_day_recovery_closes_at_the_recovery_instant() {
        // 2026-05-20 10:00 UTC is 15:30 local in Kolkata; the record is
        // dated the current local day, so it closes at `now` with the
        // open segment folded in.
        let tz = chrono_tz::Asia::Kolkata;
        let start = at(10, 0, 0);
        let now = at(10, 30, 0);
        let open = open_row(local_date_of(start, tz), start, 0.25);
        match plan_close(Some(&open), tz, now).unwrap() {
            ClosePlan::CloseToday { folded_hours } => {
                assert!((folded_hours - 0.75).abs() < 1e-9);
            }
            other => panic!("expected same-day close, got {other:?}"),
        }
    }

    #[test]
    fn recovery_after_midnight_leaves_no_active_record_and_no_phantom_hours() {
        // Down since 23:00 Kolkata local on 2026-06-01 (17:30 UTC); the
        // recovery tick lands at 00:06 local (18:36 UTC), before any
        // boundary pass has run, so the open record is still dated
        // 2026-06-01. The close must land on the day boundary, the six
        // post-midnight minutes must book to 2026-06-02 as an already
        // closed segment, and the two parts must sum to the true stall.
        let tz = chrono_tz::Asia::Kolkata;
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 17, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 18, 36, 0).unwrap();
        let open = open_row(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(), start, 0.0);

        match plan_close(Some(&open), tz, now).unwrap() {
            ClosePlan::CloseAcrossMidnight {
                boundary,
                closed_hours,
                remainder_hours,
            } => {
                assert_eq!(boundary, Utc.with_ymd_and_hms(2026, 6, 1, 18, 30, 0).unwrap());
                assert!((closed_hours - 1.0).abs() < 1e-9);
                assert!((remainder_hours - 0.1).abs() < 1e-9);
                let total = closed_hours + remainder_hours;
                assert!((total - duration_hours(start, now)).abs() < 1e-9);
            }
            other => panic!("expected cross-midnight close, got {other:?}"),
        }
    }

    #[test]
    fn reactivated_record_sums_both_stalls() {
        // First stall 09:00-09:30 closes; the record reactivates at 11:00
        // with its hours preserved and a fresh segment start, then closes
        // at 11:15. Total must be both segments summed.
        let first = fold_hours(0.0, at(9, 0, 0), at(9, 30, 0));
        let total = fold_hours(first, at(11, 0, 0), at(11, 15, 0));
        assert!((total - 0.75).abs() < 1e-9);
    }
}
