//! Per-strike gamma-exposure aggregation: net-GEX, max-gamma strike,
//! zero-gamma flip point, max-pain, and put/call ratio.

use chrono::{Duration, NaiveDate, Utc};
use rustc_hash::FxHashMap;
use services_common::errors::PipelineError;
use services_common::persistence::Store;
use services_common::types::{GEXSnapshot, OptionQuote, OptionType, StrikeGammaProfile};
use tracing::debug;

const RECENCY_WINDOW_HOURS: i64 = 4;
const CONTRACT_MULTIPLIER: f64 = 100.0;

pub struct GexCalculator {
    store: Store,
}

impl GexCalculator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Reads the most recent quote per `(strike, option_type)` for
    /// `expiration` with `gamma > 0` inside the recency window, and
    /// derives a `GEXSnapshot`. Returns `None` if no rows qualify.
    pub async fn calculate_current_gex(
        &self,
        symbol: &str,
        price_override: Option<f64>,
        expiration: NaiveDate,
    ) -> Result<Option<GEXSnapshot>, PipelineError> {
        let quotes = self
            .store
            .read_latest_options(symbol, expiration, Duration::hours(RECENCY_WINDOW_HOURS))
            .await?;

        if quotes.is_empty() {
            if let Ok(coverage) = self.store.quote_coverage_diagnostics(symbol).await {
                debug!(
                    symbol,
                    %expiration,
                    total_rows = coverage.total_rows,
                    distinct_expirations = coverage.distinct_expirations,
                    min_expiration = ?coverage.min_expiration,
                    max_expiration = ?coverage.max_expiration,
                    latest_observed_at = ?coverage.latest_observed_at,
                    "no gamma-positive quotes in recency window"
                );
            } else {
                debug!(symbol, %expiration, "no gamma-positive quotes in recency window");
            }
            return Ok(None);
        }

        let spot = match price_override {
            Some(p) => p,
            None => match self.store.read_latest_underlying(symbol).await? {
                Some(p) => p,
                None => {
                    debug!(symbol, "no underlying price available, skipping cycle");
                    return Ok(None);
                }
            },
        };

        Ok(Some(build_snapshot(symbol, expiration, spot, &quotes)))
    }
}

fn build_snapshot(
    symbol: &str,
    expiration: NaiveDate,
    spot: f64,
    quotes: &[OptionQuote],
) -> GEXSnapshot {
    let mut by_strike: FxHashMap<u64, StrikeGammaProfile> = FxHashMap::default();

    let mut call_volume = 0i64;
    let mut put_volume = 0i64;
    let mut call_oi = 0i64;
    let mut put_oi = 0i64;
    let mut vanna_exposure = 0.0;
    let mut charm_exposure = 0.0;

    for q in quotes {
        let gamma_exposure = q.gamma * q.open_interest as f64 * CONTRACT_MULTIPLIER * spot;
        let profile = by_strike.entry(q.strike.to_bits()).or_insert_with(|| StrikeGammaProfile {
            strike: q.strike,
            ..Default::default()
        });
        match q.option_type {
            OptionType::Call => {
                profile.call_gamma += gamma_exposure;
                profile.call_oi += q.open_interest;
                profile.call_volume += q.volume;
                call_volume += q.volume;
                call_oi += q.open_interest;
            }
            OptionType::Put => {
                profile.put_gamma += gamma_exposure;
                profile.put_oi += q.open_interest;
                profile.put_volume += q.volume;
                put_volume += q.volume;
                put_oi += q.open_interest;
            }
        }
        vanna_exposure += q.vega * q.delta * q.open_interest as f64;
        charm_exposure += q.gamma * q.delta * q.open_interest as f64;
    }

    let mut profiles: Vec<StrikeGammaProfile> = by_strike.into_values().collect();
    profiles.sort_by(|a, b| a.strike.partial_cmp(&b.strike).expect("strikes are finite"));

    let total_call_gamma: f64 = profiles.iter().map(|p| p.call_gamma).sum();
    let total_put_gamma: f64 = profiles.iter().map(|p| p.put_gamma).sum();
    let net_gex = total_call_gamma - total_put_gamma;
    let total_gamma_exposure = total_call_gamma + total_put_gamma;

    let (max_gamma_strike, max_gamma_value) = profiles
        .iter()
        .map(|p| (p.strike, p.total_gamma()))
        .fold((0.0, f64::MIN), |acc, x| if x.1 > acc.1 { x } else { acc });

    let gamma_flip_point = find_gamma_flip(&profiles);
    let max_pain = find_max_pain(&profiles);

    let put_call_ratio = if call_oi > 0 {
        put_oi as f64 / call_oi as f64
    } else {
        0.0
    };

    GEXSnapshot {
        observed_at: Utc::now(),
        symbol: symbol.to_string(),
        expiration,
        underlying_price: spot,
        total_gamma_exposure,
        call_gamma: total_call_gamma,
        put_gamma: total_put_gamma,
        net_gex,
        max_gamma_strike,
        max_gamma_value,
        gamma_flip_point,
        max_pain,
        put_call_ratio,
        vanna_exposure,
        charm_exposure,
        call_volume,
        put_volume,
        call_oi,
        put_oi,
        total_contracts: quotes.len() as i64,
    }
}

/// Walks strikes ascending and returns the linearly-interpolated
/// zero-crossing of the first adjacent sign change in `net_gamma`.
fn find_gamma_flip(profiles: &[StrikeGammaProfile]) -> Option<f64> {
    for pair in profiles.windows(2) {
        let (k1, n1) = (pair[0].strike, pair[0].net_gamma());
        let (k2, n2) = (pair[1].strike, pair[1].net_gamma());
        if (n1 >= 0.0) != (n2 >= 0.0) {
            return Some(k1 + (k2 - k1) * n1.abs() / (n1.abs() + n2.abs()));
        }
    }
    None
}

/// `pain(K) = sum_j (max(0, K - Kj)*call_oi_j + max(0, Kj - K)*put_oi_j) * 100`,
/// minimized over the strikes present in the active quote set. Ties go to
/// the higher strike: `profiles` is sorted ascending by the caller, so
/// folding forward with `<=` keeps replacing the running minimum as long
/// as pain doesn't increase, landing on the highest tied strike.
fn find_max_pain(profiles: &[StrikeGammaProfile]) -> Option<f64> {
    if profiles.is_empty() {
        return None;
    }
    profiles
        .iter()
        .map(|candidate| {
            let pain: f64 = profiles
                .iter()
                .map(|p| {
                    ((candidate.strike - p.strike).max(0.0) * p.call_oi as f64
                        + (p.strike - candidate.strike).max(0.0) * p.put_oi as f64)
                        * CONTRACT_MULTIPLIER
                })
                .sum();
            (candidate.strike, pain)
        })
        .fold(None, |best: Option<(f64, f64)>, candidate| match best {
            Some((_, best_pain)) if candidate.1 > best_pain => best,
            _ => Some(candidate),
        })
        .map(|(strike, _)| strike)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(strike: f64, call_oi: i64, put_oi: i64, call_gamma: f64, put_gamma: f64) -> StrikeGammaProfile {
        StrikeGammaProfile {
            strike,
            call_gamma,
            put_gamma,
            call_oi,
            put_oi,
            ..Default::default()
        }
    }

    #[test]
    fn scenario_2_max_pain_two_strikes() {
        let profiles = vec![
            profile(100.0, 0, 10, 0.0, 0.0),
            profile(110.0, 10, 0, 0.0, 0.0),
        ];
        assert_eq!(find_max_pain(&profiles), Some(110.0));
    }

    #[test]
    fn scenario_3_gamma_flip_interpolation() {
        let profiles = vec![
            profile(495.0, 0, 0, 200.0, 0.0),
            profile(500.0, 0, 0, 0.0, 100.0),
        ];
        let flip = find_gamma_flip(&profiles).unwrap();
        assert!((flip - 498.333).abs() < 1e-2);
    }

    #[test]
    fn no_sign_change_returns_none() {
        let profiles = vec![
            profile(495.0, 0, 0, 200.0, 0.0),
            profile(500.0, 0, 0, 150.0, 0.0),
        ];
        assert_eq!(find_gamma_flip(&profiles), None);
    }

    #[test]
    fn put_call_ratio_is_zero_with_no_calls() {
        let call_oi = 0i64;
        let put_oi = 50i64;
        let ratio = if call_oi > 0 {
            put_oi as f64 / call_oi as f64
        } else {
            0.0
        };
        assert_eq!(ratio, 0.0);
    }

    proptest::proptest! {
        /// A reported gamma flip point always falls within the strike
        /// range it was interpolated from, and max pain, when present,
        /// is always one of the candidate strikes (per the Open
        /// Question #5 resolution restricting the search to strikes in
        /// the active quote set).
        #[test]
        fn flip_and_max_pain_stay_within_candidate_strikes(
            strikes in proptest::collection::vec(1.0f64..2000.0, 1..12),
            call_gammas in proptest::collection::vec(-1_000.0f64..1_000.0, 1..12),
            put_gammas in proptest::collection::vec(-1_000.0f64..1_000.0, 1..12),
            call_ois in proptest::collection::vec(0i64..100_000, 1..12),
            put_ois in proptest::collection::vec(0i64..100_000, 1..12),
        ) {
            let n = [strikes.len(), call_gammas.len(), put_gammas.len(), call_ois.len(), put_ois.len()]
                .into_iter()
                .min()
                .unwrap();
            let mut profiles: Vec<StrikeGammaProfile> = (0..n)
                .map(|i| profile(strikes[i], call_ois[i], put_ois[i], call_gammas[i], put_gammas[i]))
                .collect();
            profiles.sort_by(|a, b| a.strike.partial_cmp(&b.strike).unwrap());
            profiles.dedup_by(|a, b| a.strike == b.strike);

            let candidate_strikes: Vec<f64> = profiles.iter().map(|p| p.strike).collect();

            if let Some(flip) = find_gamma_flip(&profiles) {
                let min_strike = candidate_strikes.iter().cloned().fold(f64::MAX, f64::min);
                let max_strike = candidate_strikes.iter().cloned().fold(f64::MIN, f64::max);
                proptest::prop_assert!(flip >= min_strike && flip <= max_strike);
            }

            if let Some(pain_strike) = find_max_pain(&profiles) {
                proptest::prop_assert!(candidate_strikes.contains(&pain_strike));
            }
        }
    }
}
