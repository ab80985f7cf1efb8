use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Minimum TTL applied to any write, so late data is not expired on arrival.
pub const MIN_TTL: Duration = Duration::from_secs(60);

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as i64
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// End of the bucket containing `time`: `ceil(time / interval) * interval`.
///
/// Buckets are `(end - interval, end]`, so a time exactly on a boundary
/// belongs to the bucket ending there. Times in the last partial interval
/// below `i64::MAX` saturate to the last whole bucket end.
pub fn bucket_end(time_millis: i64, interval_millis: i64) -> i64 {
    time_millis
        .saturating_add(interval_millis - 1)
        .div_euclid(interval_millis)
        * interval_millis
}

/// TTL for a row captured at `capture_time`, shortened by the row's age and
/// floored at [`MIN_TTL`]. A zero TTL means the row never expires and is
/// returned unchanged.
pub fn adjusted_ttl(ttl: Duration, capture_time: i64, now_millis: i64) -> Duration {
    if ttl.is_zero() {
        return Duration::ZERO;
    }
    let age = Duration::from_millis(now_millis.saturating_sub(capture_time).max(0) as u64);
    ttl.saturating_sub(age).max(MIN_TTL)
}

/// Converts a duration to whole milliseconds as `i64`.
pub fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}
