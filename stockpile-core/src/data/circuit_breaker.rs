//! Circuit breaker for provider rate limiting and IP bans.
//!
//! When the provider answers HTTP 403 (ban) or keeps failing with 429/5xx,
//! the breaker opens and every further request is refused until the cooldown
//! expires. The worker exits on an open breaker and the watchdog starts a new
//! one, so the trip is persisted to a small JSON file: a relaunched worker
//! reads it back and waits out the rest of the cooldown instead of hitting a
//! provider that is still banning it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    /// Requests are refused until `until`.
    Open { until: Instant },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

/// On-disk form of an open breaker.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedTrip {
    tripped_until: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    cooldown: Duration,
    failure_threshold: u32,
    state_file: Option<PathBuf>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
            state_file: None,
        }
    }

    /// Persist trips to `path`, and start open if a previous process left an
    /// unexpired trip there.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(remaining) = read_trip(&path) {
            info!(
                path = %path.display(),
                remaining_secs = remaining.as_secs(),
                "provider cooldown carried over from a previous run"
            );
            self.lock().state = BreakerState::Open {
                until: Instant::now() + remaining,
            };
        }
        self.state_file = Some(path);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded data is two plain values; a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } if Instant::now() >= until => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                drop(inner);
                self.clear_persisted();
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let failures = {
            let mut inner = self.lock();
            inner.consecutive_failures += 1;
            inner.consecutive_failures
        };
        if failures >= self.failure_threshold {
            warn!(
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened after repeated failures"
            );
            self.open();
        }
    }

    /// Open immediately (HTTP 403).
    pub fn trip(&self) {
        warn!(
            cooldown_secs = self.cooldown.as_secs(),
            "circuit breaker tripped by provider ban"
        );
        self.open();
    }

    /// Time left before requests are allowed again, `None` when closed.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        match self.lock().state {
            BreakerState::Closed => None,
            BreakerState::Open { until } => {
                Some(until.saturating_duration_since(Instant::now())).filter(|d| !d.is_zero())
            }
        }
    }

    fn open(&self) {
        self.lock().state = BreakerState::Open {
            until: Instant::now() + self.cooldown,
        };
        let Some(path) = &self.state_file else {
            return;
        };
        let cooldown = chrono::Duration::from_std(self.cooldown)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let until = Utc::now()
            .checked_add_signed(cooldown)
            .unwrap_or_else(Utc::now);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string(&PersistedTrip {
                tripped_until: until,
            })?;
            fs::write(path, json)
        };
        if let Err(e) = write() {
            warn!(path = %path.display(), error = %e, "cannot persist breaker trip");
        }
    }

    fn clear_persisted(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "breaker trip cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot clear breaker trip"),
        }
    }
}

/// Remaining cooldown recorded at `path`. Unreadable or expired files count
/// as no trip.
fn read_trip(path: &Path) -> Option<Duration> {
    let content = fs::read_to_string(path).ok()?;
    let trip: PersistedTrip = match serde_json::from_str(&content) {
        Ok(trip) => trip,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable breaker state");
            return None;
        }
    };
    (trip.tripped_until - Utc::now())
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(Duration::from_secs(60), 3);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_allowed());
        cb.record_failure();
        assert!(!cb.is_allowed());
        assert!(cb.remaining_cooldown().is_some());
    }

    #[test]
    fn success_resets_counter() {
        let cb = CircuitBreaker::new(Duration::from_secs(60), 2);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.is_allowed());
        assert_eq!(cb.remaining_cooldown(), None);
    }

    #[test]
    fn trip_then_cooldown_expiry_closes() {
        let cb = CircuitBreaker::new(Duration::from_millis(10), 3);
        cb.trip();
        assert!(!cb.is_allowed());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
        assert_eq!(cb.remaining_cooldown(), None);
    }

    #[test]
    fn trip_survives_into_a_new_breaker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/breaker.json");

        let first = CircuitBreaker::new(Duration::from_secs(1800), 3).with_state_file(&path);
        first.trip();
        assert!(path.exists());

        let second = CircuitBreaker::new(Duration::from_secs(1800), 3).with_state_file(&path);
        assert!(!second.is_allowed());
        let remaining = second.remaining_cooldown().unwrap();
        assert!(remaining > Duration::from_secs(1700));
        assert!(remaining <= Duration::from_secs(1800));
    }

    #[test]
    fn expired_trip_is_cleared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("breaker.json");

        let cb = CircuitBreaker::new(Duration::from_millis(10), 3).with_state_file(&path);
        cb.trip();
        std::thread::sleep(Duration::from_millis(15));

        let fresh = CircuitBreaker::new(Duration::from_millis(10), 3).with_state_file(&path);
        assert!(fresh.is_allowed());
        assert!(cb.is_allowed());
        assert!(!path.exists());
    }

    #[test]
    fn garbage_state_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("breaker.json");
        fs::write(&path, "not json").unwrap();
        let cb = CircuitBreaker::new(Duration::from_secs(60), 3).with_state_file(&path);
        assert!(cb.is_allowed());
    }
}
