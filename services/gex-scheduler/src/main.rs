use std::process::ExitCode;

use gex_scheduler::GexScheduler;
use services_common::config::{DbCredentials, PipelineConfig};
use services_common::persistence::{run_migrations, Store};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = PipelineConfig::load("config")?;
    let db_creds = DbCredentials::from_env()?;

    let store = Store::connect(&db_creds.connection_string()).await?;
    run_migrations(store.pool()).await?;

    let scheduler = GexScheduler::new(store, config.symbols, config.gex.interval_seconds);
    scheduler.run().await?;
    Ok(())
}
