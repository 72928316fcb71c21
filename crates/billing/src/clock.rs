//! Injectable time source
//!
//! Proration and expiry math depend on "now"; services read it through a
//! `Clock` so tests can pin time and get deterministic results.

use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

/// Source of the current time for billing computations
#[derive(Clone)]
pub struct Clock(ClockInner);

#[derive(Clone)]
enum ClockInner {
    System,
    Fixed(Arc<Mutex<OffsetDateTime>>),
}

impl Clock {
    /// Wall-clock time (production)
    pub fn system() -> Self {
        Self(ClockInner::System)
    }

    /// Pinned time (tests); advance with [`Clock::set`]
    pub fn fixed(at: OffsetDateTime) -> Self {
        Self(ClockInner::Fixed(Arc::new(Mutex::new(at))))
    }

    pub fn now(&self) -> OffsetDateTime {
        match &self.0 {
            ClockInner::System => OffsetDateTime::now_utc(),
            ClockInner::Fixed(at) => match at.lock() {
                Ok(guard) => *guard,
                // A poisoned fixed clock only happens in tests; fall back to
                // the wall clock rather than propagate a panic
                Err(_) => OffsetDateTime::now_utc(),
            },
        }
    }

    /// Move a fixed clock; no-op for the system clock
    pub fn set(&self, at: OffsetDateTime) {
        if let ClockInner::Fixed(current) = &self.0 {
            if let Ok(mut guard) = current.lock() {
                *guard = at;
            }
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            ClockInner::System => write!(f, "Clock::System"),
            ClockInner::Fixed(_) => write!(f, "Clock::Fixed({})", self.now()),
        }
    }
}
