//! Core domain types. Replaces the upstream's map-of-string-to-any
//! frames with concrete, tagged structures.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }
}

/// A point-in-time quote for a single option contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuote {
    pub observed_at: DateTime<Utc>,
    pub root_symbol: String,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    pub dte: i64,

    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub last: f64,
    pub spread_pct: Option<f64>,

    pub volume: i64,
    pub open_interest: i64,
    pub implied_vol: f64,

    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
    pub is_calculated: bool,

    pub underlying_price: f64,
}

impl OptionQuote {
    /// `(ask - bid) / max(mid, eps)` when both sides are present.
    pub fn compute_spread_pct(bid: f64, ask: f64, mid: f64) -> Option<f64> {
        if bid > 0.0 && ask > 0.0 {
            const EPS: f64 = 1e-9;
            Some((ask - bid) / mid.max(EPS))
        } else {
            None
        }
    }
}

/// OHLC bar for the underlying, upserted on `(observed_at, symbol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderlyingQuote {
    pub observed_at: DateTime<Utc>,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub total_volume: i64,
    pub up_volume: i64,
    pub down_volume: i64,
}

/// In-memory accumulator for a 5-minute tumbling window. Finalized to
/// a `FlowRow` on flush.
#[derive(Debug, Clone)]
pub struct FlowBucket {
    pub symbol: String,
    pub option_type: OptionType,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,

    pub total_volume: i64,
    pub block_volume: i64,
    pub sweep_volume: i64,
    pub trade_count: i64,

    pub premium_sum: Decimal,
    pub premium_volume_sum: Decimal,
    pub notional_sum: Decimal,
    pub underlying_price_sum: f64,
    pub price_count: i64,

    pub delta_weighted_sum: f64,
    pub gamma_weighted_sum: f64,

    pub buy_volume: i64,
    pub sell_volume: i64,

    pub atm_volume: i64,
    pub itm_volume: i64,
    pub otm_volume: i64,

    pub max_trade_size: i64,
    pub unique_strikes: HashSet<u64>,
    pub oi_samples: Vec<i64>,
}

impl FlowBucket {
    pub fn new(
        symbol: String,
        option_type: OptionType,
        bucket_start: DateTime<Utc>,
        bucket_end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            option_type,
            bucket_start,
            bucket_end,
            total_volume: 0,
            block_volume: 0,
            sweep_volume: 0,
            trade_count: 0,
            premium_sum: Decimal::ZERO,
            premium_volume_sum: Decimal::ZERO,
            notional_sum: Decimal::ZERO,
            underlying_price_sum: 0.0,
            price_count: 0,
            delta_weighted_sum: 0.0,
            gamma_weighted_sum: 0.0,
            buy_volume: 0,
            sell_volume: 0,
            atm_volume: 0,
            itm_volume: 0,
            otm_volume: 0,
            max_trade_size: 0,
            unique_strikes: HashSet::new(),
            oi_samples: Vec::new(),
        }
    }
}

/// Persisted, finalized form of a flushed `FlowBucket`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRow {
    pub observed_at: DateTime<Utc>,
    pub symbol: String,
    pub option_type: OptionType,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,

    pub total_volume: i64,
    pub block_volume: i64,
    pub sweep_volume: i64,
    pub trade_count: i64,

    pub avg_premium: Decimal,
    pub vwap_premium: Decimal,
    pub notional_sum: Decimal,
    pub avg_underlying_price: f64,
    pub avg_trade_size: f64,

    pub net_delta_exposure: f64,
    pub gamma_weighted_sum: f64,

    pub buy_volume: i64,
    pub sell_volume: i64,
    pub net_flow: i64,

    pub atm_volume: i64,
    pub itm_volume: i64,
    pub otm_volume: i64,

    pub starting_oi: i64,
    pub ending_oi: i64,
    pub oi_change: i64,
    pub unique_strikes: i64,

    pub max_trade_size: i64,
}

/// Intermediate, non-persisted per-strike structure used only during
/// GEX computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrikeGammaProfile {
    pub strike: f64,
    pub call_gamma: f64,
    pub put_gamma: f64,
    pub call_oi: i64,
    pub put_oi: i64,
    pub call_volume: i64,
    pub put_volume: i64,
}

impl StrikeGammaProfile {
    pub fn net_gamma(&self) -> f64 {
        self.call_gamma - self.put_gamma
    }

    pub fn total_gamma(&self) -> f64 {
        self.call_gamma + self.put_gamma
    }
}

/// A per-expiration, per-underlying GEX summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GEXSnapshot {
    pub observed_at: DateTime<Utc>,
    pub symbol: String,
    pub expiration: NaiveDate,

    pub underlying_price: f64,
    pub total_gamma_exposure: f64,
    pub call_gamma: f64,
    pub put_gamma: f64,
    pub net_gex: f64,
    pub max_gamma_strike: f64,
    pub max_gamma_value: f64,
    pub gamma_flip_point: Option<f64>,
    pub max_pain: Option<f64>,
    pub put_call_ratio: f64,
    pub vanna_exposure: f64,
    pub charm_exposure: f64,

    pub call_volume: i64,
    pub put_volume: i64,
    pub call_oi: i64,
    pub put_oi: i64,
    pub total_contracts: i64,
}

/// Periodic per-symbol counters, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionMetric {
    pub observed_at: DateTime<Utc>,
    pub symbol: String,
    pub received: i64,
    pub stored: i64,
    pub errors: i64,
    pub heartbeats: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub uptime_ms: i64,
}

/// Append-only liveness sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeProbe {
    pub observed_at: DateTime<Utc>,
    pub service_name: String,
    pub is_up: bool,
}

/// Tagged variant for the two shapes the streaming endpoint emits.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Heartbeat(HeartbeatFrame),
    Quote(QuoteFrame),
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "Heartbeat")]
    pub heartbeat: i64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteFrame {
    #[serde(rename = "Legs")]
    pub legs: Vec<OptionLeg>,
    #[serde(rename = "Bid")]
    pub bid: f64,
    #[serde(rename = "Ask")]
    pub ask: f64,
    #[serde(rename = "Mid")]
    pub mid: f64,
    #[serde(rename = "Last")]
    pub last: f64,
    #[serde(rename = "Volume")]
    pub volume: i64,
    #[serde(rename = "DailyOpenInterest")]
    pub daily_open_interest: i64,
    #[serde(rename = "ImpliedVolatility")]
    pub implied_volatility: f64,
    #[serde(rename = "Delta")]
    pub delta: f64,
    #[serde(rename = "Gamma")]
    pub gamma: f64,
    #[serde(rename = "Theta")]
    pub theta: f64,
    #[serde(rename = "Vega")]
    pub vega: f64,
    #[serde(rename = "Rho")]
    pub rho: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionLeg {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "StrikePrice")]
    pub strike_price: f64,
    #[serde(rename = "OptionType")]
    pub option_type: String,
    #[serde(rename = "Expiration")]
    pub expiration: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_pct_requires_both_sides() {
        assert!(OptionQuote::compute_spread_pct(0.0, 1.0, 0.5).is_none());
        assert!(OptionQuote::compute_spread_pct(1.0, 0.0, 0.5).is_none());
        let p = OptionQuote::compute_spread_pct(1.0, 1.2, 1.1).unwrap();
        assert!((p - (0.2 / 1.1)).abs() < 1e-9);
    }

    #[test]
    fn strike_gamma_profile_net_and_total() {
        let p = StrikeGammaProfile {
            strike: 100.0,
            call_gamma: 30.0,
            put_gamma: 10.0,
            ..Default::default()
        };
        assert_eq!(p.net_gamma(), 20.0);
        assert_eq!(p.total_gamma(), 40.0);
    }
}
