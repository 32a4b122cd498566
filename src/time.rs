use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds. All engine time flows through this so
/// simulations can run on a manual clock.
pub trait TimeProvider: Send + Sync + Debug {
    fn now_ms(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now_ms: RwLock<i64>,
}

impl ManualTimeProvider {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: RwLock::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        *self.now_ms.write().unwrap() = now_ms;
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        *self.now_ms.write().unwrap() += delta_ms;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_ms(&self) -> i64 {
        *self.now_ms.read().unwrap()
    }
}
