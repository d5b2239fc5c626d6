//! Logging initialization and the rate-limited notifier
//!
//! Delivery backends (Pushover, MQTT, email) live outside the daemon; the
//! notifier here decides *whether* an event should go out — per-event enable
//! flags plus a per-kind rate limit — and hands the message to a pluggable
//! sink. The default sink is the structured log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, reload};

use crate::config::{LogLevel, NotificationsConfig};
use crate::time_provider::{MonoTime, SharedTimeProvider};

/// Handle for live log-level changes.
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl LogHandle {
    /// Applies a new log level (from `main.log_level` hot-reload).
    pub fn set_level(&self, level: LogLevel) {
        let directive = format!("starfail={}", level.as_str());
        match EnvFilter::try_new(&directive) {
            Ok(filter) => {
                if let Err(e) = self.reload.reload(filter) {
                    warn!(error = %e, "failed to apply log level");
                }
            }
            Err(e) => warn!(error = %e, directive, "invalid log directive"),
        }
    }
}

/// Initializes tracing with an env-filter honoring `RUST_LOG`, falling back
/// to the configured level. Returns a handle for live level changes.
///
/// # Panics
///
/// Panics when called twice in one process (subscriber already set).
#[must_use]
pub fn init_logging(level: LogLevel, json: bool) -> LogHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("starfail={}", level.as_str())));
    let (filter, handle) = reload::Layer::new(filter);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    LogHandle { reload: handle }
}

/// Kinds of notifiable events, rate-limited independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    /// Primary switched away from a preferred member.
    Failover,
    /// Primary restored to a preferred member.
    Restore,
    /// A member left the eligible set.
    MemberDown,
    /// A member recovered.
    MemberUp,
    /// The controller failed to apply a decision.
    ControllerFailure,
}

/// Where accepted notifications go. The default implementation logs; real
/// delivery backends are wired in by the host integration.
pub trait NotifySink: Send + Sync + std::fmt::Debug {
    /// Emits one accepted notification.
    fn deliver(&self, kind: NotifyKind, message: &str);
}

/// Log-backed sink.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotifySink for LogSink {
    fn deliver(&self, kind: NotifyKind, message: &str) {
        info!(kind = ?kind, message, "notification");
    }
}

/// Applies per-event enables and per-kind rate limits before delivery.
#[derive(Debug)]
pub struct Notifier {
    sink: Arc<dyn NotifySink>,
    clock: SharedTimeProvider,
    last_sent: Mutex<HashMap<NotifyKind, MonoTime>>,
}

impl Notifier {
    /// Creates a notifier over a sink.
    pub fn new(sink: Arc<dyn NotifySink>, clock: SharedTimeProvider) -> Self {
        Self {
            sink,
            clock,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Notifies if the event kind is enabled and not rate-limited.
    /// Returns whether the notification went out.
    pub fn notify(&self, config: &NotificationsConfig, kind: NotifyKind, message: &str) -> bool {
        let enabled = match kind {
            NotifyKind::Failover => config.on_failover,
            NotifyKind::Restore => config.on_restore,
            NotifyKind::MemberDown | NotifyKind::ControllerFailure => config.on_member_down,
            NotifyKind::MemberUp => config.on_recovery,
        };
        if !enabled {
            return false;
        }

        let now = self.clock.mono();
        let mut last_sent = self.last_sent.lock();
        if let Some(last) = last_sent.get(&kind) {
            if now.since(*last) < config.rate_limit {
                return false;
            }
        }
        last_sent.insert(kind, now);
        drop(last_sent);

        self.sink.deliver(kind, message);
        true
    }
}
