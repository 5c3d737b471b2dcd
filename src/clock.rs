//! Clock and market-calendar helpers.
//!
//! All internal comparisons use UTC; Eastern time appears only for the
//! market-day classification and the market-hours test. Everything that
//! feeds a decision takes `now` as a parameter so tests stay deterministic.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;

use crate::models::Timeframe;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Calendar date in UTC.
pub fn utc_date(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// The local market day in America/New_York for a given instant.
pub fn market_day_et(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&New_York).date_naive()
}

/// Regular-session test: Monday through Friday, 09:30-16:00 Eastern.
/// Holidays are not modeled; the staleness allowance absorbs them.
pub fn is_market_hours(now: DateTime<Utc>) -> bool {
    let et = now.with_timezone(&New_York);
    let weekday = et.weekday();
    if matches!(weekday, Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let t = et.time();
    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN);
    let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN);
    t >= open && t < close
}

/// Floor `now` to the nearest slice boundary of the timeframe:
/// m15 to the 15-minute grid, h1 to the top of the hour, h4 to
/// 00/04/08/12/16/20 UTC, d1 and w1 to UTC midnight.
pub fn align_slice_end(now: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    let step = match timeframe {
        Timeframe::M15 => 900,
        Timeframe::H1 => 3_600,
        Timeframe::H4 => 14_400,
        Timeframe::D1 | Timeframe::W1 => 86_400,
    };
    let subsec = Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos()));
    let whole = now - subsec;
    let rem = whole.timestamp().rem_euclid(step);
    whole - Duration::seconds(rem)
}

/// Floor a bar timestamp into its covering bucket start for aggregation
/// (same grid as `align_slice_end`).
pub fn bucket_start(ts: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    align_slice_end(ts, timeframe)
}
