//! Per-source counters and the daily spend ledger behind the emergency stop.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::circuit::CircuitState;

/// Snapshot-friendly counters for one source. Volatile: reset on restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub current_concurrent: u32,
    pub queue_length: usize,
    pub total_cost: f64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub average_response_ms: f64,
}

impl SourceStats {
    /// A request was dispatched to the provider.
    pub fn record_dispatch(&mut self, at: DateTime<Utc>) {
        self.total_requests += 1;
        self.current_concurrent += 1;
        self.last_request_at = Some(at);
    }

    /// Undo a dispatch whose waiter vanished before it could run.
    pub fn undo_dispatch(&mut self) {
        self.total_requests = self.total_requests.saturating_sub(1);
        self.release();
    }

    pub fn release(&mut self) {
        self.current_concurrent = self.current_concurrent.saturating_sub(1);
    }

    pub fn record_success(&mut self, latency: Duration, cost: f64) {
        self.successful_requests += 1;
        self.total_cost += cost;
        let ms = latency.as_secs_f64() * 1_000.0;
        let n = self.successful_requests as f64;
        self.average_response_ms += (ms - self.average_response_ms) / n;
    }

    pub fn record_failure(&mut self) {
        self.failed_requests += 1;
    }
}

/// Spend accumulated during the current UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySpend {
    day: NaiveDate,
    spent: f64,
}

impl Default for DailySpend {
    fn default() -> Self {
        Self {
            day: today(),
            spent: 0.0,
        }
    }
}

impl DailySpend {
    fn roll(&mut self, day: NaiveDate) {
        if self.day != day {
            self.day = day;
            self.spent = 0.0;
        }
    }

    /// Add `cost` on `day` (resetting at rollover); returns the day's total.
    pub fn add_on(&mut self, day: NaiveDate, cost: f64) -> f64 {
        self.roll(day);
        self.spent += cost;
        self.spent
    }

    pub fn add(&mut self, cost: f64) -> f64 {
        self.add_on(today(), cost)
    }

    pub fn spent_on(&mut self, day: NaiveDate) -> f64 {
        self.roll(day);
        self.spent
    }

    pub fn spent(&mut self) -> f64 {
        self.spent_on(today())
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_average_latency() {
        let mut s = SourceStats::default();
        s.record_success(Duration::from_millis(100), 0.5);
        s.record_success(Duration::from_millis(300), 0.5);
        assert!((s.average_response_ms - 200.0).abs() < 1e-9);
        assert_eq!(s.successful_requests, 2);
        assert!((s.total_cost - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dispatch_and_release_track_concurrency() {
        let mut s = SourceStats::default();
        s.record_dispatch(Utc::now());
        s.record_dispatch(Utc::now());
        assert_eq!(s.current_concurrent, 2);
        s.release();
        s.undo_dispatch();
        assert_eq!(s.current_concurrent, 0);
        assert_eq!(s.total_requests, 1);
    }

    #[test]
    fn daily_spend_resets_at_rollover() {
        let d1 = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        let mut ds = DailySpend::default();
        ds.add_on(d1, 1.0);
        assert_eq!(ds.add_on(d1, 0.5), 1.5);
        assert_eq!(ds.spent_on(d2), 0.0);
        assert_eq!(ds.add_on(d2, 0.25), 0.25);
    }
}
