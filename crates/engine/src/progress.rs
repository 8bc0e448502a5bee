//! Progress reporting: per-task snapshots and a rolling byte-rate
//! meter.

use std::sync::Mutex;
use std::time::Instant;

/// Width of one rate bucket.
const BUCKET_MS: u64 = 500;

/// Buckets retained; together they span the 5 s rate window.
const BUCKET_COUNT: usize = 10;

/// Snapshot carried by `progress` events and returned by
/// `UploadTask::progress`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// 0.0–100.0.
    pub percentage: f64,
    /// Bytes per second over the recent window; 0.0 when unknown.
    pub speed: f64,
    /// Estimated seconds to completion; 0.0 when speed is unknown.
    pub remaining_time: f64,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
}

impl TaskProgress {
    /// Derives percentage from byte counts; empty files report 100
    /// once complete (0 of 0 bytes means "nothing left to send").
    pub fn compute_percentage(uploaded: u64, total: u64) -> f64 {
        if total == 0 {
            return 100.0;
        }
        uploaded as f64 / total as f64 * 100.0
    }
}

struct RateInner {
    started: Instant,
    /// Absolute index of the most recently touched bucket.
    newest: u64,
    /// Ring of per-bucket byte counts, indexed by `abs_index % len`.
    buckets: [u64; BUCKET_COUNT],
}

/// Recent transfer rate over a short rolling window.
///
/// Confirmed byte counts land in fixed [`BUCKET_MS`] buckets; the
/// rate is the windowed sum divided by the time the window actually
/// covers, so a task that has been running for less than the full
/// window is not under-reported. A burst older than the window ages
/// out as its bucket is reused.
pub struct ByteRate {
    inner: Mutex<RateInner>,
}

impl Default for ByteRate {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteRate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RateInner {
                started: Instant::now(),
                newest: 0,
                buckets: [0; BUCKET_COUNT],
            }),
        }
    }

    /// Zeroes every bucket the ring skipped between `newest` and the
    /// current instant, then repositions `newest`.
    fn roll_to(inner: &mut RateInner, bucket: u64) {
        if bucket <= inner.newest {
            return;
        }
        let skipped = (bucket - inner.newest).min(BUCKET_COUNT as u64);
        for step in 1..=skipped {
            inner.buckets[((inner.newest + step) % BUCKET_COUNT as u64) as usize] = 0;
        }
        inner.newest = bucket;
    }

    /// Credits `bytes` to the current bucket.
    pub fn record(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        let bucket = inner.started.elapsed().as_millis() as u64 / BUCKET_MS;
        Self::roll_to(&mut inner, bucket);
        inner.buckets[(bucket % BUCKET_COUNT as u64) as usize] += bytes;
    }

    /// Average bytes per second across the covered window; 0.0 before
    /// any time has passed.
    pub fn bytes_per_second(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let elapsed_ms = inner.started.elapsed().as_millis() as u64;
        Self::roll_to(&mut inner, elapsed_ms / BUCKET_MS);

        let window_ms = elapsed_ms.min(BUCKET_COUNT as u64 * BUCKET_MS);
        if window_ms == 0 {
            return 0.0;
        }
        let windowed: u64 = inner.buckets.iter().sum();
        windowed as f64 * 1_000.0 / window_ms as f64
    }

    /// Seconds to move `bytes_left` at the current rate; 0.0 when the
    /// rate is unknown.
    pub fn estimate_remaining(&self, bytes_left: u64) -> f64 {
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return 0.0;
        }
        bytes_left as f64 / rate
    }

    #[cfg(test)]
    fn pretend_elapsed(&self, extra: std::time::Duration) {
        self.inner.lock().unwrap().started -= extra;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn percentage_basics() {
        assert!((TaskProgress::compute_percentage(500, 1000) - 50.0).abs() < f64::EPSILON);
        assert!((TaskProgress::compute_percentage(0, 1000)).abs() < f64::EPSILON);
        assert!((TaskProgress::compute_percentage(1000, 1000) - 100.0).abs() < f64::EPSILON);
        assert!((TaskProgress::compute_percentage(0, 0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_meter_reports_nothing() {
        let rate = ByteRate::new();
        rate.pretend_elapsed(Duration::from_millis(800));
        assert_eq!(rate.bytes_per_second(), 0.0);
        assert_eq!(rate.estimate_remaining(1_000_000), 0.0);
    }

    #[test]
    fn rate_tracks_recorded_bytes() {
        let rate = ByteRate::new();
        rate.record(60_000);
        rate.record(40_000);
        // Pretend one full second has passed since the task started:
        // 100 kB over 1 s.
        rate.pretend_elapsed(Duration::from_secs(1));
        let bps = rate.bytes_per_second();
        assert!(
            (bps - 100_000.0).abs() < 1_000.0,
            "expected ~100 kB/s, got {bps}"
        );
    }

    #[test]
    fn short_lived_tasks_use_their_own_elapsed_time() {
        // Same bytes over half the elapsed time should read roughly
        // twice as fast.
        let slow = ByteRate::new();
        slow.record(50_000);
        slow.pretend_elapsed(Duration::from_millis(4_000));

        let fast = ByteRate::new();
        fast.record(50_000);
        fast.pretend_elapsed(Duration::from_millis(2_000));

        assert!(fast.bytes_per_second() > slow.bytes_per_second() * 1.5);
    }

    #[test]
    fn old_bursts_age_out_of_the_window() {
        let rate = ByteRate::new();
        rate.record(1_000_000);
        // Push the burst well past the whole window.
        rate.pretend_elapsed(Duration::from_secs(60));
        assert_eq!(rate.bytes_per_second(), 0.0);
    }

    #[test]
    fn remaining_estimate_scales_with_backlog() {
        let rate = ByteRate::new();
        rate.record(100_000);
        rate.pretend_elapsed(Duration::from_secs(1));

        let one = rate.estimate_remaining(100_000);
        let ten = rate.estimate_remaining(1_000_000);
        assert!(one > 0.0);
        assert!((ten / one - 10.0).abs() < 0.1);
    }
}
