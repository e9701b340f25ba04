//! Pipeline configuration: a file-backed settings layer plus
//! environment-sourced credentials, following the same
//! `config` + `dotenv` split the rest of the fleet uses.

use serde::{Deserialize, Serialize};
use std::env;

use crate::errors::PipelineError;

/// Top-level, file-backed settings. Loaded once at process start and
/// shared read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub ingestion: IngestionConfig,
    pub greeks: GreeksConfig,
    #[serde(default)]
    pub gex: GexConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub batch_size: usize,
    /// "today" or an explicit `YYYY-MM-DD` date.
    pub target_expiration: String,
    pub underlying_update_interval: u64,
    pub metrics_interval: u64,
    pub heartbeat_timeout: u64,
    pub reconnect_delay: u64,
    pub strike_proximity: Option<u32>,
    #[serde(default)]
    pub validate_greeks: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GreeksConfig {
    pub risk_free_rate: f64,
    pub dividend_yield: f64,
}

/// Scheduler cadence, kept separate from `ingestion.metrics_interval`
/// so the two services don't silently share a tuning knob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GexConfig {
    pub interval_seconds: u64,
}

impl Default for GexConfig {
    fn default() -> Self {
        Self { interval_seconds: 60 }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            target_expiration: "today".to_string(),
            underlying_update_interval: 30,
            metrics_interval: 60,
            heartbeat_timeout: 60,
            reconnect_delay: 5,
            strike_proximity: None,
            validate_greeks: false,
        }
    }
}

impl Default for GreeksConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.045,
            dividend_yield: 0.013,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["SPY".to_string()],
            ingestion: IngestionConfig::default(),
            greeks: GreeksConfig::default(),
            gex: GexConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads `path` (if present) layered over built-in defaults, then
    /// applies `APP_*`-prefixed environment overrides.
    pub fn load(path: &str) -> Result<Self, PipelineError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));
        let cfg = builder.build()?;
        let parsed: Self = cfg.try_deserialize()?;
        if parsed.symbols.is_empty() {
            return Err(PipelineError::Config("no symbols configured".to_string()));
        }
        Ok(parsed)
    }
}

/// Database connection parameters, loaded from a separate credentials
/// file via `dotenv` rather than the main settings file.
#[derive(Debug, Clone)]
pub struct DbCredentials {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl DbCredentials {
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenv::dotenv().ok();
        let get = |key: &str| -> Result<String, PipelineError> {
            env::var(key).map_err(|_| PipelineError::Config(format!("missing {key}")))
        };
        Ok(Self {
            host: get("DB_HOST")?,
            port: get("DB_PORT")?
                .parse()
                .map_err(|_| PipelineError::Config("DB_PORT not a valid port".to_string()))?,
            database: get("DB_NAME")?,
            user: get("DB_USER")?,
            password: get("DB_PASSWORD")?,
        })
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Brokerage OAuth credentials, sourced from the process environment.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub use_sandbox: bool,
}

impl BrokerCredentials {
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenv::dotenv().ok();
        let get = |key: &str| -> Result<String, PipelineError> {
            env::var(key).map_err(|_| PipelineError::Config(format!("missing {key}")))
        };
        let use_sandbox = env::var("TRADESTATION_USE_SANDBOX")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(Self {
            client_id: get("TRADESTATION_CLIENT_ID")?,
            client_secret: get("TRADESTATION_CLIENT_SECRET")?,
            refresh_token: get("TRADESTATION_REFRESH_TOKEN")?,
            use_sandbox,
        })
    }
}
