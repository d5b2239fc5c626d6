//! Collectors: one implementation per member class
//!
//! A collector always returns a [`Sample`]; failures are captured inside the
//! sample (`error`, `method`) and never propagate as control-flow errors.
//! Every class falls back to an interface-bound ping burst, and if even that
//! fails the sample is a sentinel that marks the member unusable for the
//! tick.

pub mod cellular;
pub mod dish;
pub mod lan;
pub mod ping;
pub mod starlink;
pub mod wifi;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::domain_types::MemberName;
use crate::member::{ClassExtras, CollectionMethod, Member, MemberClass, Sample};
use crate::platform::PlatformError;
use crate::time_provider::{MonoTime, SharedTimeProvider};

use self::ping::{PingStats, Pinger};

/// Packets sent to each anchor in a fallback burst.
pub const PING_BURST_PACKETS: u32 = 5;

/// Collector-internal errors. These end up inside Samples, never above them.
#[derive(Debug, Clone, Error)]
pub enum CollectorError {
    /// The class's data source is absent or refused the query.
    #[error("collector unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded its share of the tick deadline.
    #[error("collector timeout: {0}")]
    Timeout(String),

    /// The data source answered in an unexpected shape.
    #[error("collector parse error: {0}")]
    Parse(String),

    /// The tick was cancelled while collecting.
    #[error("collection cancelled")]
    Cancelled,
}

impl From<PlatformError> for CollectorError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::Timeout { .. } => CollectorError::Timeout(e.to_string()),
            PlatformError::Parse { .. } => CollectorError::Parse(e.to_string()),
            PlatformError::Spawn { .. } | PlatformError::Failed { .. } => {
                CollectorError::Unavailable(e.to_string())
            }
        }
    }
}

impl<E: std::fmt::Display> From<crate::retry::RetryError<E>> for CollectorError {
    fn from(e: crate::retry::RetryError<E>) -> Self {
        match e {
            crate::retry::RetryError::Cancelled => CollectorError::Cancelled,
            crate::retry::RetryError::DeadlineExceeded { .. } => {
                CollectorError::Timeout(e.to_string())
            }
            other => CollectorError::Unavailable(other.to_string()),
        }
    }
}

/// Per-tick context handed to every collector.
pub struct CollectContext<'a> {
    /// Config snapshot for this tick.
    pub config: &'a Config,
    /// Clock for timestamps and sleeps.
    pub clock: &'a SharedTimeProvider,
    /// Cancellation for this collection; fires when the tick deadline
    /// expires.
    pub cancel: CancellationToken,
    /// Budget for the whole collection, fallbacks included.
    pub deadline: Duration,
}

impl CollectContext<'_> {
    /// Ping anchors configured for a member.
    #[must_use]
    pub fn anchors(&self, member: &MemberName) -> Vec<String> {
        self.config
            .member(member)
            .map(|m| m.ping_anchors.clone())
            .unwrap_or_default()
    }
}

/// The per-class collection capability.
#[async_trait]
pub trait Collect: Send + Sync + std::fmt::Debug {
    /// The class this collector serves.
    fn class(&self) -> MemberClass;

    /// Produces exactly one sample for `member`. Never panics the process;
    /// failures are captured inside the sample.
    async fn collect(&self, member: &Member, ctx: &CollectContext<'_>) -> Sample;
}

/// The collectors for every member class.
#[derive(Debug, Clone)]
pub struct CollectorSet {
    collectors: HashMap<MemberClass, Arc<dyn Collect>>,
}

impl CollectorSet {
    /// Builds a set from per-class collectors.
    #[must_use]
    pub fn new(collectors: Vec<Arc<dyn Collect>>) -> Self {
        Self {
            collectors: collectors.into_iter().map(|c| (c.class(), c)).collect(),
        }
    }

    /// The collector for a class, if registered.
    #[must_use]
    pub fn for_class(&self, class: MemberClass) -> Option<Arc<dyn Collect>> {
        self.collectors.get(&class).cloned()
    }
}

/// Builds a sample from ping burst statistics.
#[must_use]
pub fn sample_from_ping(
    member: &MemberName,
    stats: &PingStats,
    method: CollectionMethod,
    error: Option<String>,
    started: MonoTime,
    ctx: &CollectContext<'_>,
) -> Sample {
    Sample {
        member: member.clone(),
        at_mono: ctx.clock.mono(),
        at_wall: ctx.clock.wall(),
        latency_ms: stats.latency_ms,
        loss_pct: stats.loss_pct,
        jitter_ms: stats.jitter_ms,
        signal_dbm: None,
        extras: ClassExtras::None,
        method,
        error,
        collected_in_ms: ctx.clock.mono().since(started).as_millis() as u64,
    }
}

/// Shared fallback: an interface-bound ping burst. Produces a
/// `ping-fallback` sample carrying the original error, or a sentinel when
/// the burst itself fails.
pub async fn ping_fallback(
    member: &Member,
    ctx: &CollectContext<'_>,
    pinger: &Arc<dyn Pinger>,
    original_error: String,
    started: MonoTime,
) -> Sample {
    let anchors = ctx.anchors(&member.name);
    match pinger
        .burst(&member.interface, &anchors, PING_BURST_PACKETS, ctx.deadline)
        .await
    {
        Ok(stats) => sample_from_ping(
            &member.name,
            &stats,
            CollectionMethod::PingFallback,
            Some(original_error),
            started,
            ctx,
        ),
        Err(ping_error) => Sample::sentinel(
            member.name.clone(),
            ctx.clock.mono(),
            ctx.clock.wall(),
            format!("{original_error}; ping fallback failed: {ping_error}"),
        ),
    }
}
