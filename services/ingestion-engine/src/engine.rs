//! Orchestrates the upstream client, Greeks calculator, and flow
//! aggregator: one stream-manager task per symbol with auto-reconnect,
//! an underlying poller, a metrics logger, and a batch buffer flushed
//! to the store.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use services_common::config::PipelineConfig;
use services_common::errors::PipelineError;
use services_common::persistence::Store;
use services_common::types::{
    HeartbeatFrame, IngestionMetric, OptionQuote, OptionType, QuoteFrame, StreamFrame,
    UnderlyingQuote, UptimeProbe,
};
use services_common::{auth::AuthManager, market_time};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::flow::OptionFlowAggregator;
use crate::greeks::BlackScholes;
use crate::upstream::UpstreamClient;

const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct SymbolCounters {
    received: AtomicI64,
    stored: AtomicI64,
    errors: AtomicI64,
    heartbeats: AtomicI64,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

/// Per-Greek percentage tolerances used by the optional
/// vendor-Greeks validation side-channel. Never affects stored
/// values, only a diagnostic log.
struct ValidationTolerances;
impl ValidationTolerances {
    const DELTA: f64 = 0.10;
    const GAMMA: f64 = 0.25;
    const THETA: f64 = 0.25;
    const VEGA: f64 = 0.20;
    const DEEP_OTM_DELTA: f64 = 0.05;
}

pub struct IngestionEngine {
    config: PipelineConfig,
    upstream: Arc<UpstreamClient>,
    greeks: BlackScholes,
    flow: Arc<OptionFlowAggregator>,
    store: Store,
    spot_cache: DashMap<String, f64>,
    last_activity: DashMap<String, Instant>,
    batch: Mutex<Vec<OptionQuote>>,
    counters: DashMap<String, SymbolCounters>,
    start_time: Instant,
    validation_count: AtomicI64,
    validation_mismatches: AtomicI64,
    consecutive_store_errors: AtomicI64,
}

/// Spec §7: store errors are non-fatal per batch, but after this many
/// consecutive failures across any store-writing task, escalate to a
/// critical log and widen the flow-flush task's sleep interval rather
/// than retrying at the normal cadence.
const MAX_CONSECUTIVE_STORE_ERRORS: i64 = 20;

impl IngestionEngine {
    pub fn new(config: PipelineConfig, auth: Arc<AuthManager>, store: Store, use_sandbox: bool) -> Arc<Self> {
        let greeks = BlackScholes::new(config.greeks.risk_free_rate, config.greeks.dividend_yield);
        let upstream = Arc::new(UpstreamClient::new(auth, use_sandbox));
        Arc::new(Self {
            config,
            upstream,
            greeks,
            flow: Arc::new(OptionFlowAggregator::new()),
            store,
            spot_cache: DashMap::new(),
            last_activity: DashMap::new(),
            batch: Mutex::new(Vec::new()),
            counters: DashMap::new(),
            start_time: Instant::now(),
            validation_count: AtomicI64::new(0),
            validation_mismatches: AtomicI64::new(0),
            consecutive_store_errors: AtomicI64::new(0),
        })
    }

    /// Spawns one stream-manager per configured symbol plus the
    /// poller/metrics/flush supervisory tasks, then blocks until
    /// ctrl-c, performing a final flush on the way out.
    pub async fn run(self: Arc<Self>) -> Result<(), PipelineError> {
        let today = market_time::now_et().date_naive();
        let expiration = market_time::resolve_target_expiration(
            &self.config.ingestion.target_expiration,
            market_time::now_et(),
        );

        let mut handles = Vec::new();
        for symbol in self.config.symbols.clone() {
            self.counters.insert(symbol.clone(), SymbolCounters::default());
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                engine.stream_manager(symbol, expiration, today).await;
            }));
        }

        {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move { engine.underlying_poller().await }));
        }
        {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move { engine.metrics_logger().await }));
        }
        {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move { engine.flow_flush_task().await }));
        }
        {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move { engine.uptime_probe_task().await }));
        }

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        info!("shutdown signal received, flushing");
        for h in handles {
            h.abort();
        }
        self.flush_batch().await?;
        let rows = self.flow.flush_old_buckets(Utc::now(), true);
        if !rows.is_empty() {
            self.store.upsert_flow(&rows).await?;
        }
        self.write_metrics().await?;
        Ok(())
    }

    /// `Starting -> Running -> Reconnecting -> Starting` per symbol.
    /// Cancellation of a stream task never propagates as a failure;
    /// it is always handled by transitioning to `Reconnecting`.
    async fn stream_manager(self: Arc<Self>, symbol: String, expiration: NaiveDate, _today: NaiveDate) {
        loop {
            let (tx, mut rx) = mpsc::channel::<StreamFrame>(1024);
            self.last_activity.insert(symbol.clone(), Instant::now());

            let upstream = Arc::clone(&self.upstream);
            let sym = symbol.clone();
            let strike_proximity = self.config.ingestion.strike_proximity;
            let stream_task = tokio::spawn(async move {
                upstream
                    .stream_options_chain(&sym, expiration, strike_proximity, tx)
                    .await
            });

            let mut heartbeat_check = interval(HEARTBEAT_CHECK_INTERVAL);
            let timeout = Duration::from_secs(self.config.ingestion.heartbeat_timeout);
            loop {
                tokio::select! {
                    maybe_frame = rx.recv() => {
                        match maybe_frame {
                            Some(frame) => self.handle_frame(&symbol, frame).await,
                            None => break, // sender dropped: stream ended
                        }
                    }
                    _ = heartbeat_check.tick() => {
                        let stale = self
                            .last_activity
                            .get(&symbol)
                            .map(|t| t.elapsed() > timeout)
                            .unwrap_or(true);
                        if stale {
                            warn!(symbol, "stale stream, reconnecting");
                            stream_task.abort();
                            break;
                        }
                    }
                }
            }
            let _ = stream_task.await;
            tokio::time::sleep(Duration::from_secs(self.config.ingestion.reconnect_delay)).await;
        }
    }

    async fn handle_frame(&self, symbol: &str, frame: StreamFrame) {
        self.last_activity.insert(symbol.to_string(), Instant::now());
        match frame {
            StreamFrame::Heartbeat(hb) => self.handle_heartbeat(symbol, hb),
            StreamFrame::Quote(q) => self.handle_quote(symbol, q).await,
        }
    }

    fn handle_heartbeat(&self, symbol: &str, hb: HeartbeatFrame) {
        if let Some(counters) = self.counters.get(symbol) {
            counters.heartbeats.fetch_add(1, Ordering::Relaxed);
            *counters.last_heartbeat.lock() = Some(hb.timestamp);
        }
    }

    async fn handle_quote(&self, symbol: &str, frame: QuoteFrame) {
        if let Some(counters) = self.counters.get(symbol) {
            counters.received.fetch_add(1, Ordering::Relaxed);
        }
        let Some(leg) = frame.legs.first() else {
            if let Some(counters) = self.counters.get(symbol) {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            return;
        };
        let option_type = match leg.option_type.to_lowercase().as_str() {
            "call" => OptionType::Call,
            "put" => OptionType::Put,
            _ => {
                if let Some(counters) = self.counters.get(symbol) {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        };

        let now = Utc::now();
        let expiration = leg.expiration.date_naive();
        let today = market_time::now_et().date_naive();
        let underlying_price = self.spot_cache.get(symbol).map(|v| *v).unwrap_or(0.0);

        let (delta, gamma, theta, vega, rho, is_calculated) = if underlying_price > 0.0
            && frame.implied_volatility > 0.0
        {
            let g = self.greeks.calculate_greeks(
                underlying_price,
                leg.strike_price,
                expiration,
                option_type,
                frame.implied_volatility,
                market_time::now_et(),
            );
            if self.config.ingestion.validate_greeks {
                self.validate_against_vendor(&g, &frame);
            }
            (g.delta, g.gamma, g.theta, g.vega, g.rho, true)
        } else {
            (
                frame.delta,
                frame.gamma,
                frame.theta,
                frame.vega,
                frame.rho,
                false,
            )
        };

        let quote = OptionQuote {
            observed_at: now,
            root_symbol: symbol.to_string(),
            strike: leg.strike_price,
            expiration,
            option_type,
            dte: market_time::dte(expiration, today),
            bid: frame.bid,
            ask: frame.ask,
            mid: frame.mid,
            last: frame.last,
            spread_pct: OptionQuote::compute_spread_pct(frame.bid, frame.ask, frame.mid),
            volume: frame.volume,
            open_interest: frame.daily_open_interest,
            implied_vol: frame.implied_volatility,
            delta,
            gamma,
            theta,
            vega,
            rho,
            is_calculated,
            underlying_price,
        };

        self.flow.add_quote(&quote);

        let should_flush = {
            let mut batch = self.batch.lock();
            batch.push(quote);
            batch.len() >= self.config.ingestion.batch_size
        };
        if should_flush {
            if let Err(e) = self.flush_batch().await {
                error!(error = %e, "batch flush failed");
                if let Some(counters) = self.counters.get(symbol) {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn validate_against_vendor(&self, calculated: &crate::greeks::Greeks, vendor: &QuoteFrame) {
        if vendor.delta.abs() < ValidationTolerances::DEEP_OTM_DELTA {
            return;
        }
        let mut mismatches = 0;
        let pct_diff = |a: f64, b: f64| if b.abs() > 1e-9 { (a - b).abs() / b.abs() } else { 0.0 };
        if pct_diff(calculated.delta, vendor.delta) > ValidationTolerances::DELTA {
            mismatches += 1;
        }
        if pct_diff(calculated.gamma, vendor.gamma) > ValidationTolerances::GAMMA {
            mismatches += 1;
        }
        if pct_diff(calculated.theta, vendor.theta) > ValidationTolerances::THETA {
            mismatches += 1;
        }
        if pct_diff(calculated.vega, vendor.vega) > ValidationTolerances::VEGA {
            mismatches += 1;
        }
        let total = self.validation_count.fetch_add(1, Ordering::Relaxed) + 1;
        if mismatches >= 2 {
            self.validation_mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(mismatches, "vendor/calculated Greeks diverge");
        }
        if total % 500 == 0 {
            info!(
                total,
                mismatches = self.validation_mismatches.load(Ordering::Relaxed),
                "Greeks validation summary"
            );
        }
    }

    async fn flush_batch(&self) -> Result<(), PipelineError> {
        let batch = {
            let mut guard = self.batch.lock();
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return Ok(());
        }
        let len = batch.len();
        match self.store.upsert_options(&batch).await {
            Ok(()) => {
                self.consecutive_store_errors.store(0, Ordering::SeqCst);
                for q in &batch {
                    if let Some(counters) = self.counters.get(&q.root_symbol) {
                        counters.stored.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, batch_size = len, "discarding batch after store error");
                self.note_store_error();
                Err(e)
            }
        }
    }

    /// Increments the consecutive-store-error counter and, past
    /// `MAX_CONSECUTIVE_STORE_ERRORS`, logs a critical line. Any
    /// successful store write elsewhere resets the counter via its own
    /// call site.
    fn note_store_error(&self) {
        let failures = self.consecutive_store_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= MAX_CONSECUTIVE_STORE_ERRORS {
            error!(failures, "store errors critical, widening flush cadence");
        }
    }

    async fn underlying_poller(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(self.config.ingestion.underlying_update_interval));
        loop {
            tick.tick().await;
            for symbol in self.config.symbols.clone() {
                match self.upstream.get_bars(&symbol).await {
                    Ok(bar) => {
                        self.spot_cache.insert(symbol.clone(), bar.close);
                        let row = UnderlyingQuote {
                            observed_at: bar.timestamp,
                            symbol: symbol.clone(),
                            open: bar.open,
                            high: bar.high,
                            low: bar.low,
                            close: bar.close,
                            total_volume: bar.total_volume,
                            up_volume: bar.up_volume,
                            down_volume: bar.down_volume,
                        };
                        match self.store.upsert_underlying(&row).await {
                            Ok(()) => self.consecutive_store_errors.store(0, Ordering::SeqCst),
                            Err(e) => {
                                warn!(symbol, error = %e, "underlying upsert failed");
                                self.note_store_error();
                            }
                        }
                    }
                    Err(e) => warn!(symbol, error = %e, "underlying poll failed"),
                }
            }
        }
    }

    async fn metrics_logger(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(self.config.ingestion.metrics_interval));
        loop {
            tick.tick().await;
            if let Err(e) = self.write_metrics().await {
                warn!(error = %e, "metrics write failed");
            }
        }
    }

    async fn write_metrics(&self) -> Result<(), PipelineError> {
        let uptime_ms = self.start_time.elapsed().as_millis() as i64;
        for entry in self.counters.iter() {
            let symbol = entry.key().clone();
            let counters = entry.value();
            let row = IngestionMetric {
                observed_at: Utc::now(),
                symbol,
                received: counters.received.load(Ordering::Relaxed),
                stored: counters.stored.load(Ordering::Relaxed),
                errors: counters.errors.load(Ordering::Relaxed),
                heartbeats: counters.heartbeats.load(Ordering::Relaxed),
                last_heartbeat: *counters.last_heartbeat.lock(),
                uptime_ms,
            };
            self.store.insert_ingestion_metric(&row).await?;
        }
        Ok(())
    }

    async fn flow_flush_task(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(60));
        let mut flush_cycles = 0u64;
        loop {
            tick.tick().await;
            let rows = self.flow.flush_old_buckets(Utc::now(), false);
            if rows.is_empty() {
                continue;
            }
            let flushed = rows.len();
            match self.store.upsert_flow(&rows).await {
                Ok(()) => self.consecutive_store_errors.store(0, Ordering::SeqCst),
                Err(e) => {
                    error!(error = %e, "flow flush failed");
                    self.note_store_error();
                    if self.consecutive_store_errors.load(Ordering::SeqCst)
                        >= MAX_CONSECUTIVE_STORE_ERRORS
                    {
                        // Critical: stop hammering a store that's been down
                        // for 20 straight flushes; wait an extra cycle
                        // before trying again.
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    continue;
                }
            }
            flush_cycles += 1;
            if flush_cycles % 10 == 0 {
                info!(flush_cycles, last_flushed = flushed, "flow aggregator flush stats");
            } else {
                tracing::debug!(flushed, "flushed flow buckets");
            }
        }
    }

    /// Samples per-symbol liveness every `heartbeat_timeout_s` and
    /// records an append-only `UptimeProbe` row, independent of the
    /// per-stream reconnect decision.
    async fn uptime_probe_task(self: Arc<Self>) {
        let interval_secs = self.config.ingestion.heartbeat_timeout.max(1);
        let mut tick = interval(Duration::from_secs(interval_secs));
        let timeout = Duration::from_secs(self.config.ingestion.heartbeat_timeout);
        loop {
            tick.tick().await;
            for symbol in self.config.symbols.clone() {
                let is_up = self
                    .last_activity
                    .get(&symbol)
                    .map(|t| t.elapsed() <= timeout)
                    .unwrap_or(false);
                let probe = UptimeProbe {
                    observed_at: Utc::now(),
                    service_name: format!("ingestion-engine:{symbol}"),
                    is_up,
                };
                if let Err(e) = self.store.insert_uptime_probe(&probe).await {
                    warn!(symbol, error = %e, "uptime probe write failed");
                }
            }
        }
    }
}

