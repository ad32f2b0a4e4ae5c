//! Progress sampling and ETA formatting

use multiwan_types::{percentage, ProgressUpdate, ETA_CALCULATING};
use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Tracks the last speed sample of a transfer
///
/// Counters are updated on every chunk, but a sample is produced only once
/// at least `interval` has passed since the previous one.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    interval: Duration,
    last_sample_time: Instant,
    last_sample_bytes: u64,
}

impl ProgressTracker {
    pub fn new(interval: Duration, start_bytes: u64) -> Self {
        Self::starting_at(interval, start_bytes, Instant::now())
    }

    pub fn starting_at(interval: Duration, start_bytes: u64, now: Instant) -> Self {
        Self {
            interval,
            last_sample_time: now,
            last_sample_bytes: start_bytes,
        }
    }

    pub fn sample(&mut self, downloaded: u64, total: u64) -> Option<ProgressUpdate> {
        self.sample_at(Instant::now(), downloaded, total)
    }

    pub fn sample_at(&mut self, now: Instant, downloaded: u64, total: u64) -> Option<ProgressUpdate> {
        let elapsed = now.saturating_duration_since(self.last_sample_time);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        let elapsed_secs = elapsed.as_secs_f64();
        let delta = downloaded.saturating_sub(self.last_sample_bytes);
        let speed_mbps = delta as f64 / elapsed_secs / BYTES_PER_MB;

        self.last_sample_time = now;
        self.last_sample_bytes = downloaded;

        Some(ProgressUpdate {
            percentage: percentage(downloaded, total),
            downloaded,
            total,
            speed_mbps,
            eta: if total == 0 {
                ETA_CALCULATING.to_string()
            } else {
                eta_label(total.saturating_sub(downloaded), speed_mbps)
            },
        })
    }
}

/// Remaining time at `speed_mbps`, or `Calculating...` with no speed
pub fn eta_label(remaining_bytes: u64, speed_mbps: f64) -> String {
    if speed_mbps <= 0.0 || !speed_mbps.is_finite() {
        return ETA_CALCULATING.to_string();
    }
    format_eta(remaining_bytes as f64 / (speed_mbps * BYTES_PER_MB))
}

/// `HH:MM:SS`, or `MM:SS` when under an hour
pub fn format_eta(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_without_hours() {
        assert_eq!(format_eta(0.0), "00:00");
        assert_eq!(format_eta(59.9), "00:59");
        assert_eq!(format_eta(125.0), "02:05");
    }

    #[test]
    fn formats_with_hours() {
        assert_eq!(format_eta(3600.0), "01:00:00");
        assert_eq!(format_eta(5025.0), "01:23:45");
    }

    #[test]
    fn zero_speed_is_calculating() {
        assert_eq!(eta_label(1000, 0.0), ETA_CALCULATING);
    }

    #[test]
    fn no_sample_before_interval() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(Duration::from_secs(1), 0, start);
        assert!(tracker
            .sample_at(start + Duration::from_millis(999), 500_000, 1_000_000)
            .is_none());
    }

    #[test]
    fn sample_after_interval_computes_speed_and_eta() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(Duration::from_secs(1), 0, start);

        let update = tracker
            .sample_at(start + Duration::from_secs(2), 2 * 1024 * 1024, 10 * 1024 * 1024)
            .expect("sample due");
        assert!((update.speed_mbps - 1.0).abs() < 1e-9);
        assert_eq!(update.percentage, 20);
        // 8 MiB left at 1 MB/s
        assert_eq!(update.eta, "00:08");
    }

    #[test]
    fn samples_are_relative_to_previous_sample() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(Duration::from_secs(1), 0, start);
        tracker.sample_at(start + Duration::from_secs(1), 1024 * 1024, 0);

        // Nothing new arrived during the next second
        let update = tracker
            .sample_at(start + Duration::from_secs(2), 1024 * 1024, 0)
            .expect("sample due");
        assert_eq!(update.speed_mbps, 0.0);
        assert_eq!(update.eta, ETA_CALCULATING);
        assert_eq!(update.percentage, 0);
    }

    #[test]
    fn unknown_total_keeps_eta_calculating() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(Duration::from_secs(1), 0, start);
        let update = tracker
            .sample_at(start + Duration::from_secs(1), 2 * 1024 * 1024, 0)
            .expect("sample due");
        assert!((update.speed_mbps - 2.0).abs() < 1e-9);
        assert_eq!(update.percentage, 0);
        assert_eq!(update.eta, ETA_CALCULATING);
    }

    #[test]
    fn resumed_transfer_measures_only_new_bytes() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(Duration::from_secs(1), 500_000, start);
        let update = tracker
            .sample_at(start + Duration::from_secs(1), 500_000 + 1024 * 1024, 4 * 1024 * 1024)
            .expect("sample due");
        assert!((update.speed_mbps - 1.0).abs() < 1e-9);
    }
}
