//! Bus timestamp handling.
//!
//! Market data and trade responses carry 17-digit millisecond timestamps
//! (`YYYYMMDDHHMMSSmmm`) in the exchange's local time. Task windows use the
//! human-readable `YYYY-MM-DD HH:MM:SS` form.

use chrono::{DateTime, Local, NaiveDateTime};

const BUS_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a local time as a 17-digit bus timestamp.
pub fn bus_timestamp(dt: DateTime<Local>) -> String {
    dt.format(BUS_FORMAT).to_string()
}

pub fn now_bus_timestamp() -> String {
    bus_timestamp(Local::now())
}

/// A valid bus timestamp is exactly 17 ASCII digits.
pub fn is_bus_timestamp(s: &str) -> bool {
    s.len() == 17 && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn parse_bus_timestamp(s: &str) -> Option<NaiveDateTime> {
    if !is_bus_timestamp(s) {
        return None;
    }
    NaiveDateTime::parse_from_str(s, BUS_FORMAT).ok()
}

/// Age of a bus timestamp relative to the local clock, in seconds.
/// Negative if the timestamp is in the future.
pub fn bus_timestamp_age_secs(s: &str) -> Option<f64> {
    let dt = parse_bus_timestamp(s)?;
    let now = Local::now().naive_local();
    Some((now - dt).num_milliseconds() as f64 / 1000.0)
}

/// Parse a task-window time (`YYYY-MM-DD HH:MM:SS`).
pub fn parse_window_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, WINDOW_FORMAT).ok()
}

pub fn format_window_time(dt: NaiveDateTime) -> String {
    dt.format(WINDOW_FORMAT).to_string()
}

pub fn now_window_time() -> String {
    format_window_time(Local::now().naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_timestamp_round_trip() {
        let ts = "20191012164822103";
        assert!(is_bus_timestamp(ts));
        let dt = parse_bus_timestamp(ts).unwrap();
        assert_eq!(dt.format(BUS_FORMAT).to_string(), ts);
    }

    #[test]
    fn rejects_wrong_shape() {
        assert!(!is_bus_timestamp("2019101216482210")); // 16 digits
        assert!(!is_bus_timestamp("201910121648221034")); // 18 digits
        assert!(!is_bus_timestamp("20191012T64822103")); // non-digit
        assert!(parse_bus_timestamp("abc").is_none());
    }

    #[test]
    fn window_time_round_trip() {
        let s = "2019-10-02 03:30:00";
        let dt = parse_window_time(s).unwrap();
        assert_eq!(format_window_time(dt), s);
    }
}
