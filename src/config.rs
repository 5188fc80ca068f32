use anyhow::{Context, Result};
use chrono::Duration;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    pub eval_interval_seconds: u64,
    pub split_interval_seconds: u64,
    pub down_threshold_minutes: u64,
    pub telemetry_lookback_minutes: u64,
    pub default_timezone: String,
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("MONITOR_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("MONITOR_DATABASE_URL must be set for the monitor runtime")?;

        let eval_interval_seconds = env_u64("MONITOR_EVAL_INTERVAL_SECONDS", 60).clamp(5, 3600);
        let split_interval_seconds = env_u64("MONITOR_SPLIT_INTERVAL_SECONDS", 300).clamp(30, 3600);
        let down_threshold_minutes = env_u64("MONITOR_DOWN_THRESHOLD_MINUTES", 10).clamp(1, 24 * 60);
        let telemetry_lookback_minutes =
            env_u64("MONITOR_TELEMETRY_LOOKBACK_MINUTES", 5).clamp(1, 60);
        let default_timezone = env_string("MONITOR_DEFAULT_TIMEZONE", "Asia/Kolkata");
        if default_timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!("MONITOR_DEFAULT_TIMEZONE is not a valid IANA timezone: {default_timezone}");
        }

        Ok(Self {
            database_url,
            eval_interval_seconds,
            split_interval_seconds,
            down_threshold_minutes,
            telemetry_lookback_minutes,
            default_timezone,
        })
    }

    pub fn down_threshold(&self) -> Duration {
        Duration::minutes(self.down_threshold_minutes as i64)
    }

    pub fn telemetry_lookback(&self) -> Duration {
        Duration::minutes(self.telemetry_lookback_minutes as i64)
    }

    /// Validated at load time; an unparseable value can only appear if the
    /// struct was built by hand, in which case the registry fallback applies.
    pub fn default_tz(&self) -> chrono_tz::Tz {
        self.default_timezone
            .parse()
            .unwrap_or(crate::registry::FALLBACK_TIMEZONE)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
