//! Streaming options-chain ingestion: upstream client, Greeks
//! calculator, flow aggregator, and the engine that wires them
//! together with reconnect/liveness supervision.

pub mod engine;
pub mod flow;
pub mod greeks;
pub mod upstream;

pub use engine::IngestionEngine;
pub use greeks::BlackScholes;
