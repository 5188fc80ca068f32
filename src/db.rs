use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Lazy pool: connections are established on first use, so the monitor can
/// start before the database is reachable and recover via its tick cadence.
pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .context("failed to create database pool")
}
