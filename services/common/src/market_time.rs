//! Single point of contact for Eastern-time market-hours gating and
//! 5-minute bucket alignment. Kept isolated so DST handling cannot
//! drift between the aggregator, the engine and the scheduler.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

const MARKET_OPEN_HOUR: u32 = 9;
const MARKET_OPEN_MINUTE: u32 = 30;
const MARKET_CLOSE_HOUR: u32 = 16;
const MARKET_CLOSE_MINUTE: u32 = 0;

/// Returns `now` converted to America/New_York wall time.
pub fn now_et() -> DateTime<Tz> {
    Utc::now().with_timezone(&New_York)
}

/// Monday-Friday, 09:30-16:00 America/New_York, inclusive of the
/// boundary minutes.
pub fn is_market_open(now: DateTime<Tz>) -> bool {
    let weekday = now.weekday().number_from_monday(); // 1..=7
    if weekday > 5 {
        return false;
    }
    let minutes_of_day = now.hour() * 60 + now.minute();
    let open = MARKET_OPEN_HOUR * 60 + MARKET_OPEN_MINUTE;
    let close = MARKET_CLOSE_HOUR * 60 + MARKET_CLOSE_MINUTE;
    minutes_of_day >= open && minutes_of_day <= close
}

/// Resolves the `"today"` / explicit-date `target_expiration` config
/// key: the current ET date if before 16:00 ET, else the next weekday.
pub fn resolve_target_expiration(spec: &str, now: DateTime<Tz>) -> NaiveDate {
    if spec != "today" {
        if let Ok(d) = NaiveDate::parse_from_str(spec, "%Y-%m-%d") {
            return d;
        }
    }
    let close_today = now
        .date_naive()
        .and_hms_opt(MARKET_CLOSE_HOUR, MARKET_CLOSE_MINUTE, 0)
        .expect("valid close time");
    if now.naive_local() < close_today {
        now.date_naive()
    } else {
        next_weekday(now.date_naive())
    }
}

fn next_weekday(mut date: NaiveDate) -> NaiveDate {
    loop {
        date += Duration::days(1);
        if date.weekday().number_from_monday() <= 5 {
            return date;
        }
    }
}

/// Floors `t` to the 5-minute bucket it belongs to: `bucket_start <= t
/// < bucket_start + 5min`, `bucket_start.minute() % 5 == 0`.
pub fn bucket_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let floored_minute = (t.minute() / 5) * 5;
    t.with_minute(floored_minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("valid truncation")
}

pub fn bucket_end(bucket_start: DateTime<Utc>) -> DateTime<Utc> {
    bucket_start + Duration::minutes(5)
}

/// Days-to-expiration as a whole-day count; `expiration` and `today`
/// are both naive calendar dates.
pub fn dte(expiration: NaiveDate, today: NaiveDate) -> i64 {
    (expiration - today).num_days().max(0)
}

/// Years-to-expiration for Black-Scholes, treating expiration as
/// 16:00 ET on `expiration_date` and clamping to a 1-hour floor to
/// avoid blow-up right at expiry.
pub fn years_to_expiration(expiration_date: NaiveDate, now: DateTime<Tz>) -> f64 {
    let exp_naive = expiration_date
        .and_hms_opt(MARKET_CLOSE_HOUR, MARKET_CLOSE_MINUTE, 0)
        .expect("valid close time");
    let exp_et = New_York
        .from_local_datetime(&exp_naive)
        .single()
        .unwrap_or_else(|| New_York.from_utc_datetime(&exp_naive));
    let seconds = (exp_et - now).num_milliseconds() as f64 / 1000.0;
    let years = seconds / (365.25 * 24.0 * 3600.0);
    let one_hour_in_years = 1.0 / 365.0 / 24.0;
    if years <= 0.0 {
        0.0
    } else {
        years.max(one_hour_in_years)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_assignment_matches_scenario_4() {
        let t = Utc.with_ymd_and_hms(2024, 2, 5, 14, 27, 31).unwrap();
        let start = bucket_start(t);
        let end = bucket_end(start);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 5, 14, 25, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 5, 14, 30, 0).unwrap());
        assert!(start <= t && t < end);
        assert_eq!(start.minute() % 5, 0);
    }

    #[test]
    fn market_closed_on_weekend() {
        let sat = New_York.with_ymd_and_hms(2024, 2, 3, 10, 0, 0).unwrap();
        assert!(!is_market_open(sat));
    }

    #[test]
    fn market_open_during_session() {
        let mon = New_York.with_ymd_and_hms(2024, 2, 5, 10, 0, 0).unwrap();
        assert!(is_market_open(mon));
    }

    #[test]
    fn zero_dte_clamped_to_one_hour() {
        let now = New_York.with_ymd_and_hms(2024, 2, 5, 15, 59, 30).unwrap();
        let t = years_to_expiration(now.date_naive(), now);
        assert!(t >= 1.0 / 365.0 / 24.0);
    }

    proptest::proptest! {
        /// Every timestamp in the 2020-2029 range buckets into a
        /// 5-minute-aligned window that contains it, regardless of
        /// second/nanosecond jitter within the minute.
        #[test]
        fn bucket_start_always_contains_t(
            epoch_seconds in 1_577_836_800i64..1_893_456_000i64,
            nanos in 0u32..1_000_000_000,
        ) {
            let t = chrono::DateTime::<Utc>::from_timestamp(epoch_seconds, nanos).unwrap();
            let start = bucket_start(t);
            let end = bucket_end(start);
            proptest::prop_assert!(start <= t && t < end);
            proptest::prop_assert_eq!(start.minute() % 5, 0);
            proptest::prop_assert_eq!(start.second(), 0);
            proptest::prop_assert_eq!((end - start).num_minutes(), 5);
        }
    }
}
