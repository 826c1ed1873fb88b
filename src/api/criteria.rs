//! Filter criteria resolution
//!
//! Resource filter templates carry date placeholders that are substituted
//! at request time. The sentinel `"N"` disables filtering entirely. All
//! resolution is driven off an explicit `now` so behavior is deterministic
//! under test; callers pass the local wall-clock time.

use chrono::{Days, NaiveDateTime, Timelike};

/// Catalogue sentinel meaning "no filter".
pub const NO_FILTER: &str = "N";

const SHIP_DATE: &str = "SHIPDATE";
const END_DATE: &str = "ENDDATE";
const DAY_OF_WEEK: &str = "xxxdowxxx";
const ORDER_DATE: &str = "xxxorderdatexxx";

/// Orders placed before this local hour ship same-day.
const ORDER_CUTOFF_HOUR: u32 = 13;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Resolve a filter template against `now` and the tenant's day offset.
pub fn resolve(template: &str, day_offset: i64, now: NaiveDateTime) -> String {
    if template == NO_FILTER {
        return String::new();
    }

    let ship_date = offset_date(now, day_offset);
    let end_date = offset_date(now, day_offset + 7);
    let order_date = order_date_for(now);

    template
        .replace(SHIP_DATE, &ship_date.format(DATE_FORMAT).to_string())
        .replace(END_DATE, &end_date.format(DATE_FORMAT).to_string())
        .replace(DAY_OF_WEEK, &ship_date.format("%A").to_string())
        .replace(ORDER_DATE, &order_date.format(DATE_FORMAT).to_string())
}

fn offset_date(now: NaiveDateTime, days: i64) -> chrono::NaiveDate {
    let date = now.date();
    if days >= 0 {
        date.checked_add_days(Days::new(days as u64)).unwrap_or(date)
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
            .unwrap_or(date)
    }
}

/// Before the 13:00 cutoff orders are dated today, after it tomorrow.
fn order_date_for(now: NaiveDateTime) -> chrono::NaiveDate {
    if now.hour() < ORDER_CUTOFF_HOUR {
        now.date()
    } else {
        offset_date(now, 1)
    }
}
