use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted form of one schedule slot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ScheduleSetting {
    /// Unix timestamp
    pub start: i64,
    /// Seconds
    pub duration: u32,
    /// Target SoC at the end of the window
    pub soc: f64,
    pub allow_feedin: bool,
}

impl Default for ScheduleSetting {
    fn default() -> Self {
        Self {
            start: 0,
            duration: 0,
            soc: 100.0,
            allow_feedin: false,
        }
    }
}

impl ScheduleSetting {
    pub fn sanitize(&mut self) {
        self.start = self.start.max(0);
        self.soc = self.soc.clamp(0.0, 100.0);
    }

    pub fn window(&self) -> Option<ScheduleWindow> {
        let start = DateTime::from_timestamp(self.start, 0)?;
        Some(ScheduleWindow {
            start,
            end: start + Duration::seconds(self.duration as i64),
            soc: self.soc,
            allow_feedin: self.allow_feedin,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub soc: f64,
    pub allow_feedin: bool,
}

impl ScheduleWindow {
    pub fn is_inside(&self, v: DateTime<Utc>) -> bool {
        self.start <= v && v < self.end
    }

    /// Seconds left until the end of the window, never negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> f64 {
        ((self.end - now).num_milliseconds() as f64 / 1000.0).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 5, 3, 9, 0, 0).unwrap();
        let w = ScheduleSetting {
            start: start.timestamp(),
            duration: 3600,
            soc: 50.0,
            allow_feedin: false,
        }
        .window()
        .unwrap();

        assert_eq!(w.end, Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap());
        assert!(!w.is_inside(start - Duration::seconds(1)));
        assert!(w.is_inside(start));
        assert!(w.is_inside(w.end - Duration::seconds(1)));
        assert!(!w.is_inside(w.end));
    }

    #[test]
    fn empty_window() {
        let w = ScheduleSetting::default().window().unwrap();
        assert!(!w.is_inside(w.start));
    }

    #[test]
    fn remaining() {
        let start = Utc.with_ymd_and_hms(2024, 5, 3, 9, 0, 0).unwrap();
        let w = ScheduleSetting {
            start: start.timestamp(),
            duration: 900,
            ..Default::default()
        }
        .window()
        .unwrap();
        assert_eq!(w.remaining(start), 900.0);
        assert_eq!(w.remaining(start + Duration::milliseconds(899_500)), 0.5);
        assert_eq!(w.remaining(w.end), 0.0);
    }

    #[test]
    fn sanitize() {
        let mut s = ScheduleSetting {
            start: -5,
            duration: 10,
            soc: 120.0,
            allow_feedin: true,
        };
        s.sanitize();
        assert_eq!(s.start, 0);
        assert_eq!(s.soc, 100.0);
    }
}
