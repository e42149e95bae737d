//! Core cache types: the RAM entry record and time-point helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Wall-clock time point. Deadlines and intervals are derived from it;
/// monotonicity is not required for correctness.
pub type TimePoint = SystemTime;

/// Milliseconds since the Unix epoch for a time point.
pub fn epoch_ms(t: TimePoint) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    epoch_ms(SystemTime::now())
}

/// Time point for an absolute epoch-millisecond stamp.
pub fn from_epoch_ms(ms: i64) -> TimePoint {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

/// Seconds elapsed since `earlier`, saturating at zero.
pub fn seconds_since(now: TimePoint, earlier: TimePoint) -> f64 {
    now.duration_since(earlier)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A resident RAM cache entry.
///
/// The engine's entry table exclusively owns entries; eviction policies only
/// ever see borrowed views.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    pub size_bytes: usize,
    pub created_at: TimePoint,
    pub last_access: TimePoint,
    /// Monotone count of successful reads.
    pub hit_count: u64,
    /// Absent means "no TTL".
    pub ttl_deadline: Option<TimePoint>,
    /// Short tag used for quotas and default miss-cost.
    pub owner: String,
}

impl Entry {
    /// Build a fresh entry stamped with the current time.
    pub fn new(value: Bytes, owner: String, ttl_deadline: Option<TimePoint>) -> Self {
        let now = SystemTime::now();
        let size_bytes = value.len();
        Self {
            value,
            size_bytes,
            created_at: now,
            last_access: now,
            hit_count: 0,
            ttl_deadline,
            owner,
        }
    }

    /// True when the entry carries a deadline at or before `now`.
    pub fn is_expired(&self, now: TimePoint) -> bool {
        matches!(self.ttl_deadline, Some(deadline) if deadline <= now)
    }
}
