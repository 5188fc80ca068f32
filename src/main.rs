use anyhow::Result;
use clap::Parser;
use machine_monitor_rs::{cli, config, db, services};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::MonitorConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;

    if args.once {
        let now = chrono::Utc::now();
        let transitions =
            services::status_engine::evaluate_machine_statuses(&pool, &config, now).await?;
        let split =
            services::midnight_split::split_downtimes_at_midnight(&pool, &config, now).await?;
        tracing::info!(transitions, split, "one-shot evaluation complete");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    services::status_engine::StatusEngineService::new(pool.clone(), config.clone())
        .start(cancel.clone());
    services::midnight_split::MidnightSplitService::new(pool, config).start(cancel.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    Ok(())
}
