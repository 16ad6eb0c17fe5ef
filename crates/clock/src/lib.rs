//! Timezone-aware time source, quiet-hours predicate, and interval scaling.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

/// The agent's single source of "now".  Every calendar-day computation and
/// every quiet-hours decision goes through the configured timezone, never UTC.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tz: Tz,
}

impl Clock {
    /// Parse an IANA timezone name, falling back to UTC on garbage input.
    pub fn new(timezone: &str) -> Self {
        let tz: Tz = timezone.parse().unwrap_or_else(|_| {
            warn!(tz = %timezone, "unrecognised timezone — falling back to UTC");
            chrono_tz::UTC
        });
        Self { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    pub fn current_hour(&self) -> u32 {
        self.now().hour()
    }

    /// Local calendar-day key (`%Y-%m-%d`) for an arbitrary UTC instant.
    pub fn day_key(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.tz).format("%Y-%m-%d").to_string()
    }

    pub fn today_key(&self) -> String {
        self.day_key(Utc::now())
    }

    pub fn is_quiet_now(&self, start_hour: u8, end_hour: u8) -> bool {
        is_quiet_hours(self.current_hour(), start_hour, end_hour)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self { tz: chrono_tz::UTC }
    }
}

/// Returns `true` when `hour` falls within `[start, end)`.  The window wraps
/// past midnight when `start > end` (e.g. 23 → 7 spans the night).
pub fn is_quiet_hours(hour: u32, start: u8, end: u8) -> bool {
    let (start, end) = (start as u32, end as u32);
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Compute the delay until the next proactive tick.
///
/// Base interval by default; stretched during quiet hours; forced back to the
/// base interval regardless of quiet hours when a critical signal was
/// collected or a module reports urgent work.
pub fn cycle_interval(
    base: Duration,
    quiet_interval: Duration,
    quiet_now: bool,
    any_critical: bool,
    urgent_work: bool,
) -> Duration {
    if any_critical || urgent_work {
        return base;
    }
    if quiet_now { quiet_interval } else { base }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_window_without_wrap() {
        assert!(is_quiet_hours(3, 1, 6));
        assert!(!is_quiet_hours(6, 1, 6));
        assert!(!is_quiet_hours(0, 1, 6));
    }

    #[test]
    fn quiet_window_wraps_midnight() {
        assert!(is_quiet_hours(23, 23, 7));
        assert!(is_quiet_hours(2, 23, 7));
        assert!(!is_quiet_hours(7, 23, 7));
        assert!(!is_quiet_hours(12, 23, 7));
    }

    #[test]
    fn interval_stretches_in_quiet_hours() {
        let base = Duration::from_secs(600);
        let quiet = Duration::from_secs(3600);
        assert_eq!(cycle_interval(base, quiet, true, false, false), quiet);
        assert_eq!(cycle_interval(base, quiet, false, false, false), base);
    }

    #[test]
    fn critical_or_urgent_overrides_quiet_hours() {
        let base = Duration::from_secs(600);
        let quiet = Duration::from_secs(3600);
        assert_eq!(cycle_interval(base, quiet, true, true, false), base);
        assert_eq!(cycle_interval(base, quiet, true, false, true), base);
    }

    #[test]
    fn bad_timezone_falls_back_to_utc() {
        let clock = Clock::new("Mars/Olympus_Mons");
        assert_eq!(clock.tz(), chrono_tz::UTC);
    }

    #[test]
    fn day_key_uses_local_timezone() {
        use chrono::TimeZone;
        let clock = Clock::new("America/New_York");
        // 02:00 UTC is still the previous day in New York.
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 2, 0, 0).unwrap();
        assert_eq!(clock.day_key(at), "2024-06-14");
    }
}
