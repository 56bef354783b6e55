//! Business-hour rules: which slots a day offers.
//!
//! Everything here is a pure function of the schedule and the date.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};

use crate::config::ScheduleConfig;

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Ordered slot start times offered on `date`.
///
/// Weekends and holidays offer nothing. The short day only has the morning shift.
pub fn slots_for_date(config: &ScheduleConfig, date: NaiveDate) -> Vec<NaiveTime> {
    if is_weekend(date) || config.holidays.contains(&date) {
        return Vec::new();
    }
    let step = config.slot_length();
    let mut slots = enumerate_range(config.morning_start, config.morning_end, step);
    if date.weekday() != config.short_day {
        slots.extend(enumerate_range(config.afternoon_start, config.afternoon_end, step));
    }
    slots
}

/// `[start, end)` at `step`. An empty or inverted range yields nothing;
/// enumeration stops rather than wrap past midnight.
fn enumerate_range(start: NaiveTime, end: NaiveTime, step: Duration) -> Vec<NaiveTime> {
    let mut slots = Vec::new();
    if step <= Duration::zero() {
        return slots;
    }
    let mut current = start;
    while current < end {
        slots.push(current);
        let (next, wrapped) = current.overflowing_add_signed(step);
        if wrapped != 0 {
            break;
        }
        current = next;
    }
    slots
}

/// First day of a `YYYY-MM` month.
pub fn parse_month(month: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", month.trim()), "%Y-%m-%d").ok()
}

/// Every weekday of the month containing `first`, in order.
pub fn business_days_in_month(first: NaiveDate) -> Vec<NaiveDate> {
    let Some(start) = first.with_day(1) else {
        return Vec::new();
    };
    start
        .iter_days()
        .take_while(|d| d.month() == start.month())
        .filter(|d| !is_weekend(*d))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn full_weekday_has_morning_and_afternoon() {
        let slots = slots_for_date(&ScheduleConfig::default(), date(2030, 3, 4)); // Monday
        assert_eq!(slots.len(), 13);
        assert_eq!(slots[0], hm(8, 0));
        assert_eq!(slots[8], hm(10, 40));
        assert_eq!(slots[9], hm(14, 10));
        assert_eq!(*slots.last().unwrap(), hm(15, 10));
        assert!(slots.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn short_day_has_morning_only() {
        let slots = slots_for_date(&ScheduleConfig::default(), date(2030, 3, 8)); // Friday
        assert_eq!(slots.len(), 9);
        assert!(slots.iter().all(|t| *t < hm(12, 0)));
    }

    #[test]
    fn weekend_is_closed() {
        let config = ScheduleConfig::default();
        assert!(slots_for_date(&config, date(2030, 3, 2)).is_empty());
        assert!(slots_for_date(&config, date(2030, 3, 3)).is_empty());
    }

    #[test]
    fn holiday_is_closed() {
        let config = ScheduleConfig {
            holidays: vec![date(2030, 3, 19)],
            ..ScheduleConfig::default()
        };
        assert!(slots_for_date(&config, date(2030, 3, 19)).is_empty());
        assert_eq!(slots_for_date(&config, date(2030, 3, 18)).len(), 13);
    }

    #[test]
    fn inverted_range_contributes_nothing() {
        let config = ScheduleConfig {
            afternoon_start: hm(16, 0),
            afternoon_end: hm(15, 0),
            ..ScheduleConfig::default()
        };
        assert_eq!(slots_for_date(&config, date(2030, 3, 4)).len(), 9);

        let empty = ScheduleConfig {
            morning_start: hm(8, 0),
            morning_end: hm(8, 0),
            ..config
        };
        assert!(slots_for_date(&empty, date(2030, 3, 4)).is_empty());
    }

    #[test]
    fn range_does_not_wrap_past_midnight() {
        let slots = enumerate_range(hm(23, 0), hm(23, 59), Duration::minutes(20));
        assert_eq!(slots, vec![hm(23, 0), hm(23, 20), hm(23, 40)]);
    }

    #[test]
    fn partial_last_step_still_starts_before_end() {
        // 14:10 + 4 * 20 = 15:30; 15:10 is the last start before the end.
        let slots = enumerate_range(hm(14, 10), hm(15, 30), Duration::minutes(20));
        assert_eq!(slots.len(), 4);
        let odd = enumerate_range(hm(14, 10), hm(15, 31), Duration::minutes(20));
        assert_eq!(odd.len(), 5);
    }

    #[test]
    fn business_days_skip_weekends() {
        let days = business_days_in_month(parse_month("2030-03").unwrap());
        assert_eq!(days.len(), 21);
        assert_eq!(days[0], date(2030, 3, 1));
        assert_eq!(days[1], date(2030, 3, 4));
        assert_eq!(*days.last().unwrap(), date(2030, 3, 29));
        assert!(days.iter().all(|d| !is_weekend(*d)));
    }

    #[test]
    fn parse_month_rejects_garbage() {
        assert_eq!(parse_month("2030-02"), Some(date(2030, 2, 1)));
        assert!(parse_month("2030-13").is_none());
        assert!(parse_month("March").is_none());
    }
}
