//! # Request Window
//! Sliding per-minute / per-hour request counting for one source.
//!
//! Stores dispatch instants oldest-first. Entries older than one hour carry no
//! information for either window and are discarded on every check.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
pub struct RequestWindow {
    stamps: VecDeque<Instant>,
}

impl RequestWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an actual dispatch. Call at dispatch time only, never when a
    /// request is merely checked or queued.
    pub fn record(&mut self, at: Instant) {
        self.stamps.push_back(at);
    }

    /// Drop entries older than the hour window.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.stamps.front() {
            if now.saturating_duration_since(t) >= HOUR {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(last_minute, last_hour)` counts at `now`.
    pub fn counts(&self, now: Instant) -> (usize, usize) {
        let mut minute = 0usize;
        let mut hour = 0usize;
        for &t in self.stamps.iter().rev() {
            let age = now.saturating_duration_since(t);
            if age >= HOUR {
                break; // older values are at the front; can stop early
            }
            hour += 1;
            if age < MINUTE {
                minute += 1;
            }
        }
        (minute, hour)
    }

    /// Prunes, then reports whether another dispatch fits both ceilings.
    pub fn can_proceed(&mut self, now: Instant, per_minute: u32, per_hour: u32) -> bool {
        self.prune(now);
        let (minute, hour) = self.counts(now);
        minute < per_minute as usize && hour < per_hour as usize
    }

    /// Earliest instant at which `can_proceed` could turn true, or `None` when it
    /// already is (or a zero ceiling means it never will).
    pub fn next_slot(&self, now: Instant, per_minute: u32, per_hour: u32) -> Option<Instant> {
        if per_minute == 0 || per_hour == 0 {
            return None;
        }
        let (minute, hour) = self.counts(now);
        let mut at: Option<Instant> = None;

        if minute >= per_minute as usize {
            // The entry that must age out is the (minute - per_minute)th of the minute window.
            let first_in_minute = self.stamps.len() - minute;
            let idx = first_in_minute + (minute - per_minute as usize);
            at = self.stamps.get(idx).map(|&t| t + MINUTE);
        }
        if hour >= per_hour as usize {
            let first_in_hour = self.stamps.len() - hour;
            let idx = first_in_hour + (hour - per_hour as usize);
            if let Some(&t) = self.stamps.get(idx) {
                let h = t + HOUR;
                at = Some(at.map_or(h, |m| m.max(h)));
            }
        }
        at
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn minute_ceiling_blocks_until_oldest_ages_out() {
        let mut w = RequestWindow::new();
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(w.can_proceed(Instant::now(), 3, 100));
            w.record(Instant::now());
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(!w.can_proceed(Instant::now(), 3, 100));
        assert_eq!(w.next_slot(Instant::now(), 3, 100), Some(t0 + MINUTE));

        tokio::time::advance(Duration::from_secs(58)).await;
        assert!(w.can_proceed(Instant::now(), 3, 100));
    }

    #[tokio::test(start_paused = true)]
    async fn hour_ceiling_and_prune() {
        let mut w = RequestWindow::new();
        for _ in 0..2 {
            w.record(Instant::now());
            tokio::time::advance(Duration::from_secs(120)).await;
        }
        assert!(!w.can_proceed(Instant::now(), 10, 2));
        assert_eq!(w.counts(Instant::now()), (0, 2));

        tokio::time::advance(HOUR).await;
        w.prune(Instant::now());
        assert!(w.is_empty());
        assert!(w.can_proceed(Instant::now(), 10, 2));
    }
}
