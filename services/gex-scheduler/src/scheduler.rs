//! Market-hours-gated loop driving periodic GEX recomputation per
//! configured symbol.

use std::time::Duration as StdDuration;

use chrono::Utc;
use services_common::errors::PipelineError;
use services_common::market_time;
use services_common::persistence::Store;
use services_common::types::UptimeProbe;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::calculator::GexCalculator;

const MARKET_CLOSED_SLEEP: StdDuration = StdDuration::from_secs(300);
const STATS_LOG_EVERY_N_CYCLES: u64 = 10;

pub struct GexScheduler {
    calculator: GexCalculator,
    store: Store,
    symbols: Vec<String>,
    interval_seconds: u64,
}

impl GexScheduler {
    pub fn new(store: Store, symbols: Vec<String>, interval_seconds: u64) -> Self {
        Self {
            calculator: GexCalculator::new(store.clone()),
            store,
            symbols,
            interval_seconds,
        }
    }

    pub async fn run(&self) -> Result<(), PipelineError> {
        let mut cycles = 0u64;
        loop {
            let now = market_time::now_et();
            self.record_liveness().await;
            if !market_time::is_market_open(now) {
                info!("market closed, sleeping 5 minutes");
                sleep(MARKET_CLOSED_SLEEP).await;
                continue;
            }

            let expiration = market_time::resolve_target_expiration("today", now);
            for symbol in &self.symbols {
                match self
                    .calculator
                    .calculate_current_gex(symbol, None, expiration)
                    .await
                {
                    Ok(Some(snapshot)) => {
                        if let Err(e) = self.store.upsert_gex(&snapshot).await {
                            warn!(symbol, error = %e, "gex upsert failed");
                            continue;
                        }
                        cycles += 1;
                        if cycles % STATS_LOG_EVERY_N_CYCLES == 0 {
                            info!(
                                symbol,
                                cycles,
                                spot = snapshot.underlying_price,
                                net_gex = snapshot.net_gex,
                                flip = ?snapshot.gamma_flip_point,
                                "gex scheduler statistics"
                            );
                        }
                    }
                    Ok(None) => {
                        info!(symbol, "no gex metrics calculated, skipping");
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "gex calculation failed, skipping symbol this cycle");
                    }
                }
            }

            sleep(StdDuration::from_secs(self.interval_seconds)).await;
        }
    }

    /// Records a liveness sample for this process once per cycle,
    /// mirroring the per-symbol probes the ingestion engine writes.
    async fn record_liveness(&self) {
        let probe = UptimeProbe {
            observed_at: Utc::now(),
            service_name: "gex-scheduler".to_string(),
            is_up: true,
        };
        if let Err(e) = self.store.insert_uptime_probe(&probe).await {
            warn!(error = %e, "uptime probe write failed");
        }
    }
}
