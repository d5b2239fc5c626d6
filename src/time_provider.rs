//! Time abstraction layer for testable time-dependent operations
//!
//! Hysteresis, cooldowns, and retry backoff all reason about elapsed time.
//! `std::time::Instant` cannot be fabricated in tests, so the daemon keeps its
//! own monotonic timestamp (`MonoTime`, milliseconds since provider creation)
//! and reads it through a `TimeProvider` that can be mocked.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep as tokio_sleep;

/// Monotonic timestamp in milliseconds since the provider was created.
///
/// Never goes backwards and survives wall-clock jumps. Not meaningful across
/// process restarts; persisted state stores remaining durations instead.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MonoTime(u64);

impl MonoTime {
    /// The zero timestamp (provider creation).
    pub const ZERO: MonoTime = MonoTime(0);

    /// Builds a timestamp from milliseconds since provider creation.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since provider creation.
    #[must_use]
    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Elapsed time since `earlier`, saturating to zero if `earlier` is newer.
    #[must_use]
    pub fn since(self, earlier: MonoTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// True once this timestamp has been reached at `now`.
    #[must_use]
    pub fn is_reached(self, now: MonoTime) -> bool {
        now.0 >= self.0
    }
}

impl std::ops::Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        MonoTime(
            self.0
                .saturating_add(u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX)),
        )
    }
}

impl std::fmt::Display for MonoTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{}ms", self.0)
    }
}

/// Trait for providing time-related functionality
///
/// Allows dependency injection of time behavior so hysteresis and cooldown
/// tests run without real delays.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Current monotonic timestamp.
    #[must_use]
    fn mono(&self) -> MonoTime;

    /// Current wall-clock time.
    #[must_use]
    fn wall(&self) -> DateTime<Utc>;

    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);
}

/// Real time provider for production use
#[derive(Debug)]
pub struct RealTimeProvider {
    origin: Instant,
}

impl RealTimeProvider {
    /// Creates a real time provider anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for RealTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    fn mono(&self) -> MonoTime {
        MonoTime(u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }
}

/// Mock time provider for testing
///
/// Time only moves when a test calls [`MockTimeProvider::advance`]; sleeps
/// yield once instead of waiting, so tick-driven scenarios run at full speed.
#[derive(Debug, Default)]
pub struct MockTimeProvider {
    millis: AtomicU64,
}

impl MockTimeProvider {
    /// Creates a mock provider starting at `MonoTime::ZERO`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the mock clock.
    pub fn advance(&self, delta: Duration) {
        self.millis.fetch_add(
            u64::try_from(delta.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
    }

    /// Sets the mock clock to an absolute monotonic timestamp.
    pub fn set(&self, at: MonoTime) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    fn mono(&self) -> MonoTime {
        MonoTime(self.millis.load(Ordering::SeqCst))
    }

    fn wall(&self) -> DateTime<Utc> {
        // Deterministic wall clock derived from the mono clock.
        let millis = i64::try_from(self.millis.load(Ordering::SeqCst)).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

/// Type alias for shared time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Create a production time provider
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider::new())
}
