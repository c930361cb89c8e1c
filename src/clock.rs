//! Millisecond clock abstraction
//!
//! Events carry timestamps stamped at enqueue time. The system clock reports
//! milliseconds since the UNIX epoch; the manual clock is test-controlled and
//! starts at zero so scenario tests can step time deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cheap cloneable handle to a millisecond time source
#[derive(Clone)]
pub struct Clock(Arc<ClockInner>);

enum ClockInner {
    System,
    Manual(AtomicU64),
}

impl Clock {
    /// Wall-clock time source (ms since UNIX epoch)
    pub fn system() -> Self {
        Clock(Arc::new(ClockInner::System))
    }

    /// Test-controlled time source starting at 0 ms
    pub fn manual() -> Self {
        Clock(Arc::new(ClockInner::Manual(AtomicU64::new(0))))
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        match &*self.0 {
            ClockInner::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            ClockInner::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Advance a manual clock. No-op on the system clock.
    pub fn advance(&self, ms: u64) {
        if let ClockInner::Manual(now) = &*self.0 {
            now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    /// Set a manual clock to an absolute time. No-op on the system clock.
    pub fn set(&self, ms: u64) {
        if let ClockInner::Manual(now) = &*self.0 {
            now.store(ms, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0 {
            ClockInner::System => write!(f, "Clock::System"),
            ClockInner::Manual(ms) => write!(f, "Clock::Manual({}ms)", ms.load(Ordering::SeqCst)),
        }
    }
}
