use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

mod eval;
pub mod types;

pub use eval::{decide_status, is_transition, ledger_action, LedgerAction, StatusDecision};
pub use types::{MachineState, PriorState};

use crate::config::MonitorConfig;
use crate::registry::{self, MachineRow};
use crate::services::downtime_ledger;
use crate::telemetry;
use crate::time::local_date_of;

/// Recurring evaluation tick: classifies every active machine as
/// RUNNING/DOWN and drives the downtime ledger on transitions.
#[derive(Debug, Clone)]
pub struct StatusEngineService {
    pool: PgPool,
    config: MonitorConfig,
}

impl StatusEngineService {
    pub fn new(pool: PgPool, config: MonitorConfig) -> Self {
        Self { pool, config }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.eval_interval_seconds));
            // An overrunning pass skips the missed trigger instead of
            // queueing a burst behind it.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) =
                            evaluate_machine_statuses(&self.pool, &self.config, Utc::now()).await
                        {
                            tracing::warn!(error = %err, "status engine tick failed");
                        }
                    }
                }
            }
        });
    }
}

#[derive(Debug, Clone, FromRow)]
struct StatusRow {
    status: String,
    down_since: Option<DateTime<Utc>>,
}

/// Evaluates every active machine once. Per-machine failures are logged and
/// skipped so one bad machine cannot stall the fleet-wide tick. Returns the
/// number of RUNNING/DOWN transitions dispatched.
pub async fn evaluate_machine_statuses(
    pool: &PgPool,
    config: &MonitorConfig,
    now: DateTime<Utc>,
) -> Result<usize> {
    let machines = registry::list_active_machines(pool).await?;
    let mut transitions = 0usize;

    for machine in machines {
        let Some(device_id) = machine
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            tracing::warn!(machine_id = %machine.id, "machine has no device identifier, skipping");
            continue;
        };

        match evaluate_machine(pool, config, &machine, device_id, now).await {
            Ok(true) => transitions += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    machine_id = %machine.id,
                    device_id,
                    error = %err,
                    "machine evaluation failed"
                );
            }
        }
    }

    Ok(transitions)
}

async fn evaluate_machine(
    pool: &PgPool,
    config: &MonitorConfig,
    machine: &MachineRow,
    device_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let tz = registry::customer_timezone(pool, machine.customer_id, config.default_tz()).await?;
    let local_date = local_date_of(now, tz);

    let prior = load_prior_state(pool, device_id, local_date).await?;

    let samples = telemetry::query_recent(pool, device_id, now - config.telemetry_lookback()).await?;
    let signal = telemetry::scan_window(&samples);

    let decision = eval::decide_status(
        prior.and_then(|state| state.down_since),
        signal.has_production,
        now,
        config.down_threshold(),
    );

    // Unconditional write: evaluated_at reflects liveness even when the
    // status is unchanged.
    upsert_status(pool, machine, device_id, local_date, &decision, &signal, now).await?;

    let prior_status = prior.map(|state| state.status);
    match eval::ledger_action(prior_status, decision.status) {
        LedgerAction::Start => {
            downtime_ledger::start_downtime(pool, config, machine, now).await?;
        }
        LedgerAction::End => {
            downtime_ledger::end_downtime(pool, config, machine, now).await?;
        }
        LedgerAction::None => {}
    }

    Ok(eval::is_transition(prior_status, decision.status))
}

/// Prior persisted state for the grace anchor and transition dispatch.
/// Today's row wins; with none yet (first tick after a local midnight) the
/// most recent earlier day's row carries the status and anchor across the
/// boundary, so an in-progress stall keeps its anchor instead of being
/// granted a fresh grace period.
async fn load_prior_state(
    pool: &PgPool,
    device_id: &str,
    local_date: NaiveDate,
) -> Result<Option<PriorState>> {
    let row: Option<StatusRow> = sqlx::query_as(
        r#"
        SELECT status, down_since
        FROM machine_status
        WHERE device_id = $1 AND local_date = $2
        "#,
    )
    .bind(device_id)
    .bind(local_date)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => Some(row),
        None => {
            sqlx::query_as(
                r#"
                SELECT status, down_since
                FROM machine_status
                WHERE device_id = $1 AND local_date < $2
                ORDER BY local_date DESC
                LIMIT 1
                "#,
            )
            .bind(device_id)
            .bind(local_date)
            .fetch_optional(pool)
            .await?
        }
    };

    let Some(row) = row else {
        return Ok(None);
    };

    let Some(status) = MachineState::parse(&row.status) else {
        tracing::warn!(device_id, stored = row.status, "unrecognized stored status, ignoring");
        return Ok(None);
    };

    Ok(Some(PriorState {
        status,
        down_since: row.down_since,
    }))
}

async fn upsert_status(
    pool: &PgPool,
    machine: &MachineRow,
    device_id: &str,
    local_date: NaiveDate,
    decision: &StatusDecision,
    signal: &telemetry::ProductionSignal,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO machine_status (
            machine_id,
            device_id,
            local_date,
            status,
            current_prod_count,
            previous_prod_count,
            last_seen_at,
            evaluated_at,
            down_since
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (device_id, local_date)
        DO UPDATE SET
            machine_id = EXCLUDED.machine_id,
            status = EXCLUDED.status,
            current_prod_count = EXCLUDED.current_prod_count,
            previous_prod_count = EXCLUDED.previous_prod_count,
            last_seen_at = COALESCE(EXCLUDED.last_seen_at, machine_status.last_seen_at),
            evaluated_at = EXCLUDED.evaluated_at,
            down_since = EXCLUDED.down_since
        "#,
    )
    .bind(machine.id)
    .bind(device_id)
    .bind(local_date)
    .bind(decision.status.as_str())
    .bind(signal.last_count)
    .bind(signal.first_count)
    .bind(signal.last_seen_at)
    .bind(now)
    .bind(decision.down_since)
    .execute(pool)
    .await?;

    Ok(())
}
