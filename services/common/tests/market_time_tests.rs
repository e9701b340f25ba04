use chrono::{NaiveDate, TimeZone};
use chrono_tz::America::New_York;
use services_common::market_time;

#[test]
fn resolves_today_before_close() {
    let now = New_York.with_ymd_and_hms(2024, 2, 5, 10, 0, 0).unwrap();
    let exp = market_time::resolve_target_expiration("today", now);
    assert_eq!(exp, NaiveDate::from_ymd_opt(2024, 2, 5).unwrap());
}

#[test]
fn resolves_next_weekday_after_close() {
    // Friday after 16:00 rolls to the following Monday.
    let now = New_York.with_ymd_and_hms(2024, 2, 2, 16, 30, 0).unwrap();
    let exp = market_time::resolve_target_expiration("today", now);
    assert_eq!(exp, NaiveDate::from_ymd_opt(2024, 2, 5).unwrap());
}

#[test]
fn explicit_date_passes_through() {
    let now = New_York.with_ymd_and_hms(2024, 2, 5, 10, 0, 0).unwrap();
    let exp = market_time::resolve_target_expiration("2024-03-15", now);
    assert_eq!(exp, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
}
