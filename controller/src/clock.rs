use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.trim().parse().ok()
}

/// Wall-clock time in `tz`, pinned to the offset in force at that instant.
pub fn to_local(now: DateTime<Utc>, tz: Tz) -> DateTime<FixedOffset> {
    let local = now.with_timezone(&tz);
    local.with_timezone(&local.offset().fix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn london_observes_summer_time() {
        let tz = parse_timezone("Europe/London").unwrap();

        let winter = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let summer = Utc.with_ymd_and_hms(2026, 7, 6, 12, 0, 0).unwrap();

        assert_eq!(to_local(winter, tz).hour(), 12);
        assert_eq!(to_local(summer, tz).hour(), 13);
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(parse_timezone("Mars/Olympus").is_none());
    }
}
