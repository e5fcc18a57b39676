//! Service clock, fixed at UTC+8.
//!
//! Every persisted or compared timestamp in the service is timezone-aware
//! at UTC+8. All "now" reads funnel through [`Clock`] so tests can inject
//! a fixed, manually-advanced time source.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use std::sync::{Arc, Mutex};

/// Offset of the service wall clock from UTC, in seconds.
const UTC8_SECS: i32 = 8 * 3600;

/// The fixed UTC+8 timezone used for all persisted timestamps.
pub fn service_timezone() -> FixedOffset {
    // 8 hours east is always within chrono's valid offset range.
    FixedOffset::east_opt(UTC8_SECS).expect("UTC+8 is a valid fixed offset")
}

/// Cheap cloneable handle to the service time source.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

enum ClockInner {
    System,
    Fixed(Mutex<DateTime<FixedOffset>>),
}

impl Clock {
    /// System-backed clock reporting the current time at UTC+8.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(ClockInner::System),
        }
    }

    /// Fixed clock for tests, starting at `start`. Time only moves via
    /// [`Clock::set`] and [`Clock::advance`].
    pub fn fixed(start: DateTime<FixedOffset>) -> Self {
        Self {
            inner: Arc::new(ClockInner::Fixed(Mutex::new(start))),
        }
    }

    /// Current service time at UTC+8.
    pub fn now(&self) -> DateTime<FixedOffset> {
        match self.inner.as_ref() {
            ClockInner::System => Utc::now().with_timezone(&service_timezone()),
            ClockInner::Fixed(t) => *t.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Set the fixed time. No-op on a system clock.
    pub fn set(&self, to: DateTime<FixedOffset>) {
        if let ClockInner::Fixed(t) = self.inner.as_ref() {
            *t.lock().unwrap_or_else(|e| e.into_inner()) = to;
        }
    }

    /// Advance the fixed time by `by`. No-op on a system clock.
    pub fn advance(&self, by: Duration) {
        if let ClockInner::Fixed(t) = self.inner.as_ref() {
            let mut guard = t.lock().unwrap_or_else(|e| e.into_inner());
            *guard = *guard + by;
        }
    }
}

/// Parse an ISO 8601 timestamp from the wire. Timestamps with an offset are
/// converted to UTC+8; bare timestamps are interpreted as already being
/// UTC+8.
pub fn parse_wire_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(t.with_timezone(&service_timezone()));
    }
    // Bare "YYYY-MM-DDTHH:MM:SS[.frac]" without an offset.
    let naive = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    naive.and_local_timezone(service_timezone()).single()
}
