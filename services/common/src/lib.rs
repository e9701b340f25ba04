//! Shared types, error kinds, configuration, and persistence for the
//! options-chain ingestion and GEX analytics pipeline.

pub mod auth;
pub mod config;
pub mod errors;
pub mod market_time;
pub mod persistence;
pub mod types;

pub use auth::AuthManager;
pub use config::PipelineConfig;
pub use errors::PipelineError;
pub use persistence::Store;
pub use types::*;
