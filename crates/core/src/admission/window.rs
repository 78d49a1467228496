use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CalendarConfig;

/// Aligns instants to minute and calendar-day boundaries in a fixed UTC offset.
#[derive(Clone, Copy, Debug)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Calendar {
    pub fn new(config: CalendarConfig) -> Self {
        let offset =
            FixedOffset::east_opt(config.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(CalendarConfig { utc_offset_minutes: 0 })
    }

    pub fn minute_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let seconds = at.timestamp();
        DateTime::from_timestamp(seconds - seconds.rem_euclid(60), 0).unwrap_or(at)
    }

    pub fn day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn day_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = self.day(at).and_hms_opt(0, 0, 0).unwrap_or_default();
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(at)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSpan {
    Minute,
    Day,
}

impl WindowSpan {
    pub fn length(self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::Day => Duration::days(1),
        }
    }

    fn align(self, calendar: &Calendar, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Minute => calendar.minute_start(at),
            Self::Day => calendar.day_start(at),
        }
    }
}

/// Fixed (non-sliding) usage counter for one provider limit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    pub span: WindowSpan,
    pub counter: u64,
    pub window_start: DateTime<Utc>,
    pub limit: u64,
    pub safety_fraction: f64,
}

impl RateWindow {
    pub fn new(
        span: WindowSpan,
        limit: u64,
        safety_fraction: f64,
        calendar: &Calendar,
        now: DateTime<Utc>,
    ) -> Self {
        Self { span, counter: 0, window_start: span.align(calendar, now), limit, safety_fraction }
    }

    pub fn safe_limit(&self) -> u64 {
        (self.limit as f64 * self.safety_fraction).floor() as u64
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + self.span.length()
    }

    /// Resets the counter when `now` has crossed into a later aligned window.
    /// Returns whether a reset happened; a second call in the same window is a no-op.
    pub fn roll(&mut self, now: DateTime<Utc>, calendar: &Calendar) -> bool {
        let aligned = self.span.align(calendar, now);
        if aligned > self.window_start {
            self.counter = 0;
            self.window_start = aligned;
            return true;
        }
        false
    }

    /// Whether `amount` more units stay within the enforced (safe) limit.
    pub fn admits(&self, amount: u64) -> bool {
        self.counter.saturating_add(amount) <= self.safe_limit()
    }

    /// Request windows deny once the counter has reached the safe limit.
    pub fn has_headroom(&self) -> bool {
        self.counter < self.safe_limit()
    }

    pub fn add(&mut self, amount: u64) {
        self.counter = self.counter.saturating_add(amount).min(self.limit);
    }

    pub fn subtract(&mut self, amount: u64) {
        self.counter = self.counter.saturating_sub(amount);
    }

    pub fn usage_pct(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.counter as f64 / self.limit as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Timelike, Utc};

    use super::{Calendar, RateWindow, WindowSpan};
    use crate::config::CalendarConfig;

    #[test]
    fn minute_window_resets_once_per_boundary() {
        let calendar = Calendar::utc();
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 10, 15, 42).single().expect("timestamp");
        let mut window = RateWindow::new(WindowSpan::Minute, 30, 0.8, &calendar, start);
        assert_eq!(window.window_start.second(), 0);

        window.add(7);
        assert!(!window.roll(start + Duration::seconds(10), &calendar));
        assert_eq!(window.counter, 7);

        let next = start + Duration::seconds(20);
        assert!(window.roll(next, &calendar));
        window.add(1);
        assert!(!window.roll(next, &calendar));
        assert_eq!(window.counter, 1);
        assert_eq!(window.resets_at(), window.window_start + Duration::minutes(1));
    }

    #[test]
    fn safe_limit_floors_the_margin() {
        let calendar = Calendar::utc();
        let window = RateWindow::new(WindowSpan::Minute, 30, 0.8, &calendar, Utc::now());
        assert_eq!(window.safe_limit(), 24);

        let odd = RateWindow::new(WindowSpan::Day, 14_401, 0.8, &calendar, Utc::now());
        assert_eq!(odd.safe_limit(), 11_520);
    }

    #[test]
    fn counter_stays_within_zero_and_nominal_limit() {
        let calendar = Calendar::utc();
        let mut window = RateWindow::new(WindowSpan::Minute, 100, 0.8, &calendar, Utc::now());
        window.add(250);
        assert_eq!(window.counter, 100);
        window.subtract(400);
        assert_eq!(window.counter, 0);
    }

    #[test]
    fn day_window_aligns_to_local_midnight_of_configured_offset() {
        let calendar = Calendar::new(CalendarConfig { utc_offset_minutes: -180 });
        // 01:30 UTC is still the previous evening at UTC-3.
        let at = Utc.with_ymd_and_hms(2026, 5, 5, 1, 30, 0).single().expect("timestamp");
        let window = RateWindow::new(WindowSpan::Day, 500_000, 0.8, &calendar, at);

        assert_eq!(
            window.window_start,
            Utc.with_ymd_and_hms(2026, 5, 4, 3, 0, 0).single().expect("timestamp")
        );

        let mut rolled = window.clone();
        assert!(!rolled.roll(at + Duration::hours(1), &calendar));
        assert!(rolled.roll(at + Duration::hours(2), &calendar));
    }
}
