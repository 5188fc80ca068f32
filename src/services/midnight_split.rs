use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::registry;
use crate::services::downtime_ledger::{fold_hours, DowntimeRow};
use crate::time::{day_end_boundary, local_date_of};

/// Recurring check that closes out downtime records whose local day has
/// ended while still active and opens a continuation record for the new
/// day.
///
/// Runs on a fixed short interval rather than per-timezone midnight timers:
/// each record is checked against its own customer's zone, and a run that
/// finds nothing to split is free, so frequent cheap re-checks are the
/// simplest correct cadence for a mixed-timezone fleet.
#[derive(Debug, Clone)]
pub struct MidnightSplitService {
    pool: PgPool,
    config: MonitorConfig,
}

impl MidnightSplitService {
    pub fn new(pool: PgPool, config: MonitorConfig) -> Self {
        Self { pool, config }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.split_interval_seconds));
            // An overrunning pass skips the missed trigger instead of
            // queueing a burst behind it.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match split_downtimes_at_midnight(&self.pool, &self.config, Utc::now()).await {
                            Ok(count) if count > 0 => {
                                tracing::info!(count, "split downtimes across local day boundary");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "midnight split tick failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Splits every active downtime record whose local day has rolled over.
/// Idempotent: a record already dated the current local day is untouched,
/// so running more than once per day is safe. Returns the number of records
/// split.
pub async fn split_downtimes_at_midnight(
    pool: &PgPool,
    config: &MonitorConfig,
    now: DateTime<Utc>,
) -> Result<usize> {
    let active: Vec<DowntimeRow> = sqlx::query_as(
        r#"
        SELECT id, machine_id, customer_id, local_date, start_time, end_time,
               accumulated_hours, is_active, reason
        FROM downtimes
        WHERE is_active = TRUE
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut split = 0usize;
    for record in active {
        match split_record(pool, config, &record, now).await {
            Ok(true) => split += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    downtime_id = record.id,
                    machine_id = %record.machine_id,
                    error = %err,
                    "failed to split downtime record"
                );
            }
        }
    }

    Ok(split)
}

/// True when `record_date` is no longer the current local day in `tz`.
fn needs_split(record_date: NaiveDate, now: DateTime<Utc>, tz: Tz) -> bool {
    record_date != local_date_of(now, tz)
}

async fn split_record(
    pool: &PgPool,
    config: &MonitorConfig,
    record: &DowntimeRow,
    now: DateTime<Utc>,
) -> Result<bool> {
    let tz = registry::customer_timezone(pool, record.customer_id, config.default_tz()).await?;
    if !needs_split(record.local_date, now, tz) {
        return Ok(false);
    }

    let boundary = day_end_boundary(record.local_date, tz)?;
    let closed_hours = fold_hours(record.accumulated_hours, record.start_time, boundary);
    let current_local_date = local_date_of(now, tz);

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
    .bind(record.id)
    .bind(closed_hours)
    .bind(boundary)
    .execute(&mut *tx)
    .await?;

    // The evaluator may already have opened (or opened and closed) today's
    // record if a post-midnight tick ran before this pass; a second active
    // record for the same machine-day must never be created. The check
    // skips the common case and the partial unique index on
    // (machine_id, local_date) WHERE is_active makes the insert itself
    // race-free against a concurrent evaluator tick.
    let existing_today: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM downtimes
        WHERE machine_id = $1 AND local_date = $2
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(record.machine_id)
    .bind(current_local_date)
    .fetch_optional(&mut *tx)
    .await?;

    if existing_today.is_none() {
        sqlx::query(
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
            "#,
        )
        .bind(record.machine_id)
        .bind(record.customer_id)
        .bind(current_local_date)
        .bind(boundary)
        .bind(&record.reason)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::debug!(
        downtime_id = record.id,
        machine_id = %record.machine_id,
        closed_date = %record.local_date,
        continued_date = %current_local_date,
        "closed downtime at local midnight and opened continuation"
    );

    Ok(true)
}
