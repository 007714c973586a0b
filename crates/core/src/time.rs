//! Wall-clock helpers

use chrono::{Local, TimeZone};

/// Current time in unix milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `YYYYmmdd_HHMMSS` in local time, the stamp used in directory names
pub fn dir_stamp(ts_ms: u64) -> String {
    match Local.timestamp_millis_opt(ts_ms as i64).single() {
        Some(dt) => dt.format("%Y%m%d_%H%M%S").to_string(),
        None => format!("{}", ts_ms / 1000),
    }
}

/// `YYYY-mm-dd HH:MM:SS` in local time
pub fn display_time(ts_ms: u64) -> String {
    match Local.timestamp_millis_opt(ts_ms as i64).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts_ms.to_string(),
    }
}

/// Parse a `YYYYmmdd_HHMMSS` local stamp back to unix milliseconds
pub fn parse_dir_stamp(stamp: &str) -> Option<u64> {
    let naive = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    u64::try_from(local.timestamp_millis()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_roundtrip() {
        let ts = 1_704_292_200_000; // whole second
        let stamp = dir_stamp(ts);
        assert_eq!(stamp.len(), 15);
        assert_eq!(parse_dir_stamp(&stamp), Some(ts));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_dir_stamp("yesterday"), None);
    }
}
