use std::process::ExitCode;

use services_common::config::{BrokerCredentials, DbCredentials, PipelineConfig};
use services_common::persistence::{run_migrations, Store};
use services_common::AuthManager;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ingestion_engine::IngestionEngine;

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
    let broker_creds = BrokerCredentials::from_env()?;

    let store = Store::connect(&db_creds.connection_string()).await?;
    run_migrations(store.pool()).await?;

    let use_sandbox = broker_creds.use_sandbox;
    let auth = AuthManager::new(broker_creds);
    let engine = IngestionEngine::new(config, auth, store, use_sandbox);
    engine.run().await?;
    Ok(())
}
