use serde::{Deserialize, Serialize};

/// Summed per-thread resource usage. Every component is nullable because
/// not all platforms report it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStats {
    pub cpu_nanos: Option<i64>,
    pub blocked_nanos: Option<i64>,
    pub waited_nanos: Option<i64>,
    pub allocated_bytes: Option<i64>,
}

impl ThreadStats {
    /// Adds `other` component-wise. A component stays null only while every
    /// input for it has been null.
    pub fn merge(&mut self, other: &ThreadStats) {
        self.cpu_nanos = sum_nullable(self.cpu_nanos, other.cpu_nanos);
        self.blocked_nanos = sum_nullable(self.blocked_nanos, other.blocked_nanos);
        self.waited_nanos = sum_nullable(self.waited_nanos, other.waited_nanos);
        self.allocated_bytes = sum_nullable(self.allocated_bytes, other.allocated_bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_nanos.is_none()
            && self.blocked_nanos.is_none()
            && self.waited_nanos.is_none()
            && self.allocated_bytes.is_none()
    }
}

/// Null-as-zero addition that keeps `None` only when both sides are `None`.
pub fn sum_nullable(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
    }
}
