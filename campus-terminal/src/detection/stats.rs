//! Daily and running detection counters

use campus_protocol::DetectionStatsView;
use chrono::{Local, NaiveDate};

/// Running detection statistics; the daily counter follows the local calendar
#[derive(Debug, Clone)]
pub struct DetectionStats {
    today_count: u64,
    total_count: u64,
    max_count: u32,
    detection_sum: u64,
    last_day_reset: NaiveDate,
}

impl Default for DetectionStats {
    fn default() -> Self {
        Self::starting(Local::now().date_naive())
    }
}

impl DetectionStats {
    pub fn starting(today: NaiveDate) -> Self {
        Self {
            today_count: 0,
            total_count: 0,
            max_count: 0,
            detection_sum: 0,
            last_day_reset: today,
        }
    }

    pub fn record(&mut self, count: u32) {
        self.record_on(count, Local::now().date_naive());
    }

    pub fn record_on(&mut self, count: u32, today: NaiveDate) {
        self.roll_over(today);
        self.today_count += 1;
        self.total_count += 1;
        self.max_count = self.max_count.max(count);
        self.detection_sum += u64::from(count);
    }

    fn roll_over(&mut self, today: NaiveDate) {
        if today != self.last_day_reset {
            self.today_count = 0;
            self.last_day_reset = today;
        }
    }

    /// Snapshot as of now; a new day starts the daily counter from zero
    pub fn view(&mut self) -> DetectionStatsView {
        self.view_on(Local::now().date_naive())
    }

    pub fn view_on(&mut self, today: NaiveDate) -> DetectionStatsView {
        self.roll_over(today);
        DetectionStatsView {
            today_count: self.today_count,
            total_count: self.total_count,
            max_count: self.max_count,
            avg_count: if self.total_count == 0 {
                0.0
            } else {
                self.detection_sum as f64 / self.total_count as f64
            },
            last_day_reset: Some(self.last_day_reset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average_and_daily_reset() {
        let monday = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let tuesday = monday.succ_opt().unwrap();
        let mut stats = DetectionStats::starting(monday);

        stats.record_on(4, monday);
        stats.record_on(2, monday);
        let view = stats.view_on(monday);
        assert_eq!(view.today_count, 2);
        assert_eq!(view.max_count, 4);
        assert_eq!(view.avg_count, 3.0);

        stats.record_on(9, tuesday);
        let view = stats.view_on(tuesday);
        assert_eq!(view.today_count, 1);
        assert_eq!(view.total_count, 3);
        assert_eq!(view.max_count, 9);
        assert_eq!(view.last_day_reset, Some(tuesday));
    }

    #[test]
    fn test_quiet_day_still_resets_on_read() {
        let monday = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let tuesday = monday.succ_opt().unwrap();
        let mut stats = DetectionStats::starting(monday);
        stats.record_on(5, monday);

        let view = stats.view_on(tuesday);
        assert_eq!(view.today_count, 0);
        assert_eq!(view.total_count, 1);
        assert_eq!(view.last_day_reset, Some(tuesday));
    }
}
