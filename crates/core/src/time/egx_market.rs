use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use std::collections::HashSet;

const EET_OFFSET_SECS: i32 = 2 * 3600;

// EGX trades Sunday through Thursday, 10:00-14:30 Cairo time.
const OPEN_HOUR_EET: u32 = 10;
const OPEN_MINUTE_EET: u32 = 0;
const CLOSE_HOUR_EET: u32 = 14;
const CLOSE_MINUTE_EET: u32 = 30;

// If the job runs before this time (EET), treat it as "yesterday's" trading
// date. Slightly after the 14:30 close to let the feed settle.
const CLOSE_CUTOFF_HOUR_EET: u32 = 15;
const CLOSE_CUTOFF_MINUTE_EET: u32 = 0;

pub fn is_market_open(now_utc: DateTime<Utc>) -> bool {
    let Some(eet) = chrono::FixedOffset::east_opt(EET_OFFSET_SECS) else {
        return false;
    };
    let now_eet = now_utc.with_timezone(&eet);
    let date = now_eet.date_naive();

    if is_weekend(date) || configured_holidays().contains(&date) {
        return false;
    }

    let open = NaiveTime::from_hms_opt(OPEN_HOUR_EET, OPEN_MINUTE_EET, 0);
    let close = NaiveTime::from_hms_opt(CLOSE_HOUR_EET, CLOSE_MINUTE_EET, 0);
    match (open, close) {
        (Some(open), Some(close)) => {
            let t = now_eet.time();
            t >= open && t < close
        }
        _ => false,
    }
}

pub fn resolve_trading_date(
    trading_date_arg: Option<&str>,
    now_utc: DateTime<Utc>,
) -> anyhow::Result<NaiveDate> {
    if let Some(s) = trading_date_arg {
        return Ok(NaiveDate::parse_from_str(s, "%Y-%m-%d")?);
    }

    let eet = chrono::FixedOffset::east_opt(EET_OFFSET_SECS).context("invalid EET offset")?;
    let now_eet = now_utc.with_timezone(&eet);

    let cutoff_reached = (now_eet.hour(), now_eet.minute())
        >= (CLOSE_CUTOFF_HOUR_EET, CLOSE_CUTOFF_MINUTE_EET);
    let mut date = now_eet.date_naive();
    if !cutoff_reached {
        date = date - Duration::days(1);
    }

    // Roll back to the previous trading day.
    let holidays = configured_holidays();
    while is_weekend(date) || holidays.contains(&date) {
        date = date - Duration::days(1);
    }

    Ok(date)
}

fn is_weekend(date: NaiveDate) -> bool {
    // Egyptian weekend.
    matches!(date.weekday(), chrono::Weekday::Fri | chrono::Weekday::Sat)
}

fn configured_holidays() -> HashSet<NaiveDate> {
    // Fixed-date public holidays only; movable feasts (Eid, Sham El-Nessim)
    // must be supplied via EG_MARKET_HOLIDAYS="YYYY-MM-DD,YYYY-MM-DD".
    let mut out = HashSet::new();
    let years = [2024, 2025, 2026, 2027, 2028, 2029, 2030];
    for y in years {
        for (m, d) in [
            (1, 7),   // Coptic Christmas
            (1, 25),  // Revolution Day
            (4, 25),  // Sinai Liberation Day
            (5, 1),   // Labour Day
            (6, 30),  // June 30 Revolution
            (7, 23),  // Revolution Day (1952)
            (10, 6),  // Armed Forces Day
        ] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                out.insert(date);
            }
        }
    }

    if let Ok(s) = std::env::var("EG_MARKET_HOLIDAYS") {
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Ok(d) = NaiveDate::parse_from_str(part, "%Y-%m-%d") {
                out.insert(d);
            }
        }
    }

    out
}
