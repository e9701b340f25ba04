//! Tumbling 5-minute flow aggregator. Accumulates per-quote premium,
//! notional, and delta/gamma-weighted sums, infers buy/sell pressure
//! from bid/ask positioning, and flushes completed buckets to rows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use services_common::market_time;
use services_common::types::{FlowBucket, FlowRow, OptionQuote, OptionType};
use tracing::debug;

const BLOCK_VOLUME_THRESHOLD: i64 = 100;
const ATM_THRESHOLD_PCT: f64 = 0.02;
const SWEEP_BUY_THRESHOLD: f64 = 0.9;
const BUY_THRESHOLD: f64 = 0.6;
const SELL_THRESHOLD: f64 = 0.4;
const SWEEP_SELL_THRESHOLD: f64 = 0.1;

type BucketKey = (String, OptionType, DateTime<Utc>);

pub struct OptionFlowAggregator {
    buckets: Mutex<HashMap<BucketKey, FlowBucket>>,
}

impl Default for OptionFlowAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionFlowAggregator {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Accumulates a quote into its 5-minute bucket. No-op for
    /// `volume <= 0`.
    pub fn add_quote(&self, quote: &OptionQuote) {
        if quote.volume <= 0 {
            return;
        }
        let start = market_time::bucket_start(quote.observed_at);
        let end = market_time::bucket_end(start);
        let key = (quote.root_symbol.clone(), quote.option_type, start);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(|| {
            FlowBucket::new(quote.root_symbol.clone(), quote.option_type, start, end)
        });
        accumulate(bucket, quote);
    }

    /// Moves every bucket with `bucket_start < now`'s current bucket
    /// boundary (or, if `force_all`, every bucket) out of the map and
    /// finalizes it. The lock is held only for the move, never during
    /// the caller's subsequent I/O.
    pub fn flush_old_buckets(&self, now: DateTime<Utc>, force_all: bool) -> Vec<FlowRow> {
        let current_start = market_time::bucket_start(now);
        let mut to_flush = Vec::new();
        {
            let mut buckets = self.buckets.lock();
            let keys: Vec<BucketKey> = buckets
                .keys()
                .filter(|(_, _, start)| force_all || *start < current_start)
                .cloned()
                .collect();
            for key in keys {
                if let Some(bucket) = buckets.remove(&key) {
                    to_flush.push(bucket);
                }
            }
        }
        debug!(count = to_flush.len(), force_all, "flushing flow buckets");
        to_flush.into_iter().map(finalize).collect()
    }
}

fn accumulate(bucket: &mut FlowBucket, quote: &OptionQuote) {
    let volume = quote.volume;
    bucket.total_volume += volume;
    bucket.trade_count += 1;
    if volume >= BLOCK_VOLUME_THRESHOLD {
        bucket.block_volume += volume;
    }

    let premium = Decimal::try_from(quote.mid).unwrap_or(Decimal::ZERO)
        * Decimal::from(volume)
        * Decimal::from(100);
    bucket.premium_sum += premium;
    bucket.premium_volume_sum += premium * Decimal::from(volume);

    let notional = Decimal::try_from(quote.underlying_price).unwrap_or(Decimal::ZERO)
        * Decimal::from(volume)
        * Decimal::from(100);
    bucket.notional_sum += notional;

    if quote.underlying_price > 0.0 {
        bucket.underlying_price_sum += quote.underlying_price;
        bucket.price_count += 1;
    }

    bucket.delta_weighted_sum +=
        volume as f64 * quote.delta.abs() * quote.underlying_price * 100.0;
    if quote.gamma > 0.0 {
        bucket.gamma_weighted_sum += volume as f64 * quote.gamma;
    }

    classify_buy_sell(bucket, quote, volume);
    classify_strike(bucket, quote);

    bucket.max_trade_size = bucket.max_trade_size.max(volume);
    bucket.unique_strikes.insert(quote.strike.to_bits());
    bucket.oi_samples.push(quote.open_interest);
}

fn classify_buy_sell(bucket: &mut FlowBucket, quote: &OptionQuote, volume: i64) {
    if !(quote.bid > 0.0 && quote.ask > quote.bid && quote.last > 0.0) {
        // Unusable quote: no buy/sell volume recorded, matching the
        // upstream aggregator's own gating.
        return;
    }
    let p = (quote.last - quote.bid) / (quote.ask - quote.bid);
    if p > BUY_THRESHOLD {
        bucket.buy_volume += volume;
        if p > SWEEP_BUY_THRESHOLD {
            bucket.sweep_volume += volume;
        }
        return;
    }
    if p < SELL_THRESHOLD {
        bucket.sell_volume += volume;
        if p < SWEEP_SELL_THRESHOLD {
            bucket.sweep_volume += volume;
        }
        return;
    }
    // Mid-spread: split evenly. Integer-division halves can lose one
    // contract for odd volumes; accepted per the upstream's own behavior.
    bucket.buy_volume += volume / 2;
    bucket.sell_volume += volume - volume / 2;
}

fn classify_strike(bucket: &mut FlowBucket, quote: &OptionQuote) {
    if quote.underlying_price <= 0.0 {
        return;
    }
    let spot = quote.underlying_price;
    let moneyness = (quote.strike - spot).abs() / spot;
    if moneyness <= ATM_THRESHOLD_PCT {
        bucket.atm_volume += quote.volume;
        return;
    }
    let is_itm = match quote.option_type {
        OptionType::Call => quote.strike < spot,
        OptionType::Put => quote.strike > spot,
    };
    if is_itm {
        bucket.itm_volume += quote.volume;
    } else {
        bucket.otm_volume += quote.volume;
    }
}

fn finalize(bucket: FlowBucket) -> FlowRow {
    let total_volume_dec = Decimal::from(bucket.total_volume.max(1));
    let avg_premium = bucket.premium_sum / total_volume_dec;
    let vwap_denominator = Decimal::from(bucket.total_volume) * Decimal::from(bucket.total_volume);
    let vwap_premium = if vwap_denominator.is_zero() {
        Decimal::ZERO
    } else {
        bucket.premium_volume_sum / vwap_denominator
    };
    let avg_underlying_price = if bucket.price_count > 0 {
        bucket.underlying_price_sum / bucket.price_count as f64
    } else {
        0.0
    };
    let avg_trade_size = if bucket.trade_count > 0 {
        bucket.total_volume as f64 / bucket.trade_count as f64
    } else {
        0.0
    };
    let net_delta_exposure = match bucket.option_type {
        OptionType::Call => bucket.delta_weighted_sum,
        OptionType::Put => -bucket.delta_weighted_sum,
    };
    let starting_oi = bucket.oi_samples.first().copied().unwrap_or(0);
    let ending_oi = bucket.oi_samples.last().copied().unwrap_or(0);

    FlowRow {
        observed_at: bucket.bucket_start,
        symbol: bucket.symbol,
        option_type: bucket.option_type,
        bucket_start: bucket.bucket_start,
        bucket_end: bucket.bucket_end,
        total_volume: bucket.total_volume,
        block_volume: bucket.block_volume,
        sweep_volume: bucket.sweep_volume,
        trade_count: bucket.trade_count,
        avg_premium,
        vwap_premium,
        notional_sum: bucket.notional_sum,
        avg_underlying_price,
        avg_trade_size,
        net_delta_exposure,
        gamma_weighted_sum: bucket.gamma_weighted_sum,
        buy_volume: bucket.buy_volume,
        sell_volume: bucket.sell_volume,
        net_flow: bucket.buy_volume - bucket.sell_volume,
        atm_volume: bucket.atm_volume,
        itm_volume: bucket.itm_volume,
        otm_volume: bucket.otm_volume,
        starting_oi,
        ending_oi,
        oi_change: ending_oi - starting_oi,
        unique_strikes: bucket.unique_strikes.len() as i64,
        max_trade_size: bucket.max_trade_size,
    }
}
