//! Time abstractions for testability
//!
//! This module provides trait-based abstractions for time operations,
//! enabling deterministic testing of the engine's timers.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Instant in time (monotonic clock)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64); // Microseconds since the clock's origin

impl Instant {
    /// Create from microseconds
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Get microseconds value
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Duration since another instant
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        let micros = u64::try_from(duration.as_micros()).ok()?;
        self.0.checked_add(micros).map(Instant)
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        self.checked_add(rhs).unwrap_or(Instant(u64::MAX))
    }
}

/// Abstraction for time operations
pub trait Clock: Send + Sync {
    /// Get current instant (monotonic)
    fn now(&self) -> Instant;

    /// Get current system time
    fn system_time(&self) -> SystemTime;
}

/// Production clock measuring from the moment it was created
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let micros = self.origin.elapsed().as_micros();
        Instant::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Mock clock for deterministic testing
///
/// Clones share the same time source, so a test can keep one handle and give
/// another to the engine.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    current_micros: Arc<Mutex<u64>>,
}

impl MockClock {
    /// Create new mock clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance time by duration
    pub fn advance(&self, duration: Duration) {
        let delta = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let mut current = self.current_micros.lock();
        *current = current.saturating_add(delta);
    }

    /// Set absolute time
    pub fn set(&self, micros: u64) {
        *self.current_micros.lock() = micros;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        Instant::from_micros(*self.current_micros.lock())
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_micros(*self.current_micros.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));
        let end = clock.now();

        assert_eq!(end.duration_since(start), Duration::from_secs(10));
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::new();
        let shared = clock.clone();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(shared.now().as_micros(), 1_500_000);
    }

    #[test]
    fn test_instant_arithmetic_saturates() {
        let instant = Instant::from_micros(5);
        assert_eq!(instant.duration_since(Instant::from_micros(10)), Duration::ZERO);
        assert_eq!(instant + Duration::MAX, Instant::from_micros(u64::MAX));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
