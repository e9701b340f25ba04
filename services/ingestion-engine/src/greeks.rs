//! Black-Scholes Greeks with continuous dividend yield. Pure
//! functions over `(S, K, expiration, option_type, sigma, now)`; no
//! implied-volatility re-derivation happens on this path — IV is
//! vendor-supplied at ingest time.

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use services_common::market_time;
use services_common::types::OptionType;

const SQRT_2PI: f64 = 2.506_628_274_631_000_7;

fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}

fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / SQRT_2PI
}

/// The five Greeks the ingestion path stores, plus the two
/// second-order approximations (`vanna`, `charm`) the GEX calculator
/// aggregates across the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
    pub vanna: f64,
    pub charm: f64,
}

pub struct BlackScholes {
    pub risk_free_rate: f64,
    pub dividend_yield: f64,
}

impl BlackScholes {
    pub fn new(risk_free_rate: f64, dividend_yield: f64) -> Self {
        Self {
            risk_free_rate,
            dividend_yield,
        }
    }

    /// Computes Greeks for one contract at `now`. Handles `T <= 0` by
    /// returning the expiry-limit Greeks rather than dividing by zero.
    pub fn calculate_greeks(
        &self,
        underlying_price: f64,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
        implied_vol: f64,
        now: DateTime<Tz>,
    ) -> Greeks {
        let t = market_time::years_to_expiration(expiration, now);
        if t <= 0.0 {
            return Self::expired_greeks(underlying_price, strike, option_type);
        }
        self.greeks_at(underlying_price, strike, implied_vol, t, option_type)
    }

    fn greeks_at(
        &self,
        s: f64,
        k: f64,
        sigma: f64,
        t: f64,
        option_type: OptionType,
    ) -> Greeks {
        let r = self.risk_free_rate;
        let q = self.dividend_yield;
        let sqrt_t = t.sqrt();

        let d1 = ((s / k).ln() + (r - q + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
        let d2 = d1 - sigma * sqrt_t;

        let nd1 = norm_cdf(d1);
        let nd2 = norm_cdf(d2);
        let npd1 = norm_pdf(d1);
        let disc_q = (-q * t).exp();
        let disc_r = (-r * t).exp();

        let (delta, theta, rho) = match option_type {
            OptionType::Call => {
                let delta = disc_q * nd1;
                let theta = (-s * npd1 * sigma * disc_q / (2.0 * sqrt_t)
                    - r * k * disc_r * nd2
                    + q * s * disc_q * nd1)
                    / 365.0;
                let rho = k * t * disc_r * nd2 / 100.0;
                (delta, theta, rho)
            }
            OptionType::Put => {
                let nd1_neg = norm_cdf(-d1);
                let nd2_neg = norm_cdf(-d2);
                let delta = -disc_q * nd1_neg;
                let theta = (-s * npd1 * sigma * disc_q / (2.0 * sqrt_t)
                    + r * k * disc_r * nd2_neg
                    - q * s * disc_q * nd1_neg)
                    / 365.0;
                let rho = -k * t * disc_r * nd2_neg / 100.0;
                (delta, theta, rho)
            }
        };

        let gamma = npd1 * disc_q / (s * sigma * sqrt_t);
        let vega = s * disc_q * npd1 * sqrt_t / 100.0;
        let vanna = vega * delta;
        let charm = gamma * delta;

        Greeks {
            delta: round_to(delta, 6),
            gamma: round_to(gamma, 8),
            theta: round_to(theta, 6),
            vega: round_to(vega, 6),
            rho: round_to(rho, 6),
            vanna,
            charm,
        }
    }

    fn expired_greeks(underlying_price: f64, strike: f64, option_type: OptionType) -> Greeks {
        let is_itm = match option_type {
            OptionType::Call => underlying_price > strike,
            OptionType::Put => underlying_price < strike,
        };
        let delta = if is_itm {
            match option_type {
                OptionType::Call => 1.0,
                OptionType::Put => -1.0,
            }
        } else {
            0.0
        };
        Greeks {
            delta,
            ..Default::default()
        }
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn atm_0dte_call_inputs() -> (f64, f64, NaiveDate, DateTime<Tz>) {
        let now = New_York.with_ymd_and_hms(2024, 2, 5, 9, 30, 0).unwrap();
        (600.0, 600.0, now.date_naive(), now)
    }

    #[test]
    fn scenario_1_atm_0dte_call() {
        let (s, k, exp, now) = atm_0dte_call_inputs();
        let bs = BlackScholes::new(0.045, 0.013);
        let call = bs.calculate_greeks(s, k, exp, OptionType::Call, 0.15, now);
        assert!((call.delta - 0.51).abs() < 0.05);
        assert!(call.gamma > 0.0);
        assert!(call.vega > 0.0);
        assert!(call.theta < 0.0);

        let put = bs.calculate_greeks(s, k, exp, OptionType::Put, 0.15, now);
        let t = market_time::years_to_expiration(exp, now);
        let expected_parity = (-0.013_f64 * t).exp();
        assert!((call.delta - put.delta - expected_parity).abs() < 1e-4);
    }

    #[test]
    fn expired_itm_call_has_delta_one() {
        let bs = BlackScholes::new(0.045, 0.013);
        let now = New_York.with_ymd_and_hms(2024, 2, 5, 16, 30, 0).unwrap();
        let exp = NaiveDate::from_ymd_opt(2024, 2, 5).unwrap();
        let g = bs.calculate_greeks(610.0, 600.0, exp, OptionType::Call, 0.15, now);
        assert_eq!(g.delta, 1.0);
        assert_eq!(g.gamma, 0.0);
    }

    #[test]
    fn expired_otm_put_has_delta_zero() {
        let bs = BlackScholes::new(0.045, 0.013);
        let now = New_York.with_ymd_and_hms(2024, 2, 5, 16, 30, 0).unwrap();
        let exp = NaiveDate::from_ymd_opt(2024, 2, 5).unwrap();
        let g = bs.calculate_greeks(610.0, 600.0, exp, OptionType::Put, 0.15, now);
        assert_eq!(g.delta, 0.0);
    }

    #[test]
    fn put_call_parity_holds_for_longer_dated_options() {
        let bs = BlackScholes::new(0.045, 0.013);
        let now = New_York.with_ymd_and_hms(2024, 2, 5, 9, 30, 0).unwrap();
        let exp = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let call = bs.calculate_greeks(600.0, 610.0, exp, OptionType::Call, 0.18, now);
        let put = bs.calculate_greeks(600.0, 610.0, exp, OptionType::Put, 0.18, now);
        let t = market_time::years_to_expiration(exp, now);
        let expected = (-0.013_f64 * t).exp();
        assert!((call.delta - put.delta - expected).abs() < 1e-6);
    }

    #[rstest::rstest]
    #[case::deep_itm_call(600.0, 500.0, OptionType::Call, 0.20, 0.9)]
    #[case::deep_otm_call(600.0, 700.0, OptionType::Call, 0.20, 0.05)]
    #[case::deep_itm_put(600.0, 700.0, OptionType::Put, 0.20, -0.9)]
    #[case::deep_otm_put(600.0, 500.0, OptionType::Put, 0.20, -0.05)]
    #[case::atm_call(600.0, 600.0, OptionType::Call, 0.20, 0.5)]
    fn delta_sign_and_bounds_hold_across_moneyness(
        #[case] spot: f64,
        #[case] strike: f64,
        #[case] option_type: OptionType,
        #[case] sigma: f64,
        #[case] expected_delta: f64,
    ) {
        let bs = BlackScholes::new(0.045, 0.013);
        let now = New_York.with_ymd_and_hms(2024, 2, 5, 9, 30, 0).unwrap();
        let exp = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let g = bs.calculate_greeks(spot, strike, exp, option_type, sigma, now);
        assert!((g.delta - expected_delta).abs() < 0.15, "delta={}, expected~{}", g.delta, expected_delta);
        assert!(g.gamma >= 0.0);
        assert!(g.vega >= 0.0);
    }

    proptest::proptest! {
        /// Put-call parity (`call.delta - put.delta == exp(-q*T)`) holds
        /// for any spot/strike/vol combination at least an hour from
        /// expiry, independent of moneyness.
        #[test]
        fn put_call_parity_holds_across_random_inputs(
            spot in 50.0f64..2000.0,
            strike in 50.0f64..2000.0,
            sigma in 0.05f64..1.5,
        ) {
            let bs = BlackScholes::new(0.045, 0.013);
            let now = New_York.with_ymd_and_hms(2024, 2, 5, 9, 30, 0).unwrap();
            let exp = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
            let call = bs.calculate_greeks(spot, strike, exp, OptionType::Call, sigma, now);
            let put = bs.calculate_greeks(spot, strike, exp, OptionType::Put, sigma, now);
            let t = market_time::years_to_expiration(exp, now);
            let expected = (-0.013_f64 * t).exp();
            proptest::prop_assert!((call.delta - put.delta - expected).abs() < 1e-4);
        }
    }
}
