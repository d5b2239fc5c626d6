//! Controller: applies decisions to the external multi-WAN routing engine
//!
//! The controller never forwards packets or rewrites routes itself. It sets
//! per-member routing metrics (low = preferred), asks the engine to reload
//! its policy, and verifies within a bounded window that the engine reports
//! the intended primary. Demoted members always get the constant bad metric;
//! deriving it from the previous value would run away across failovers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain_types::{InterfaceName, MemberName, RouteMetric};
use crate::member::Decision;
use crate::platform::{CommandRunner, PlatformError, Ubus};
use crate::registry::{DiscoveredMember, RegistrySnapshot};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::time_provider::SharedTimeProvider;

/// How long the controller waits for the engine to settle on the new primary.
const VERIFY_DEADLINE: Duration = Duration::from_secs(10);
/// Poll interval while verifying.
const VERIFY_POLL: Duration = Duration::from_millis(500);

/// Controller errors. These surface as Decision failures; the engine backs
/// off and the registry keeps its previous state.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The routing engine could not be reached or rejected a command.
    #[error("routing engine unavailable: {0}")]
    EngineUnavailable(String),

    /// After reload and one retry the engine still reports another primary.
    #[error("routing engine reports {got:?} as primary, expected {expected}")]
    VerifyMismatch {
        /// Primary the decision selected.
        expected: MemberName,
        /// Primary the engine reported, if any.
        got: Option<MemberName>,
    },

    /// Cancellation arrived mid-apply.
    #[error("apply cancelled")]
    Cancelled,
}

impl From<PlatformError> for ControllerError {
    fn from(e: PlatformError) -> Self {
        ControllerError::EngineUnavailable(e.to_string())
    }
}

/// The routing-engine contract: metric mutation, policy reload, and the
/// engine's own view of the active primary.
#[async_trait]
pub trait RouteEngine: Send + Sync + std::fmt::Debug {
    /// Sets a member's routing metric.
    async fn set_metric(
        &self,
        member: &MemberName,
        interface: &InterfaceName,
        metric: RouteMetric,
    ) -> Result<(), ControllerError>;

    /// Commits pending metric changes and reloads the engine's policy.
    async fn reload(&self) -> Result<(), ControllerError>;

    /// The member the engine currently routes through, if it knows one.
    async fn active_primary(&self) -> Result<Option<MemberName>, ControllerError>;

    /// Interfaces the engine tracks, for registry discovery.
    async fn inventory(&self) -> Result<Vec<DiscoveredMember>, ControllerError>;
}

/// Applies decisions to a [`RouteEngine`]. All routing-engine access is
/// serialized through this type so reloads never overlap.
#[derive(Debug)]
pub struct Controller {
    engine: Arc<dyn RouteEngine>,
    clock: SharedTimeProvider,
}

impl Controller {
    /// Creates a controller over an engine.
    pub fn new(engine: Arc<dyn RouteEngine>, clock: SharedTimeProvider) -> Self {
        Self { engine, clock }
    }

    /// The wrapped engine (for discovery).
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn RouteEngine> {
        &self.engine
    }

    /// Applies a decision: new primary gets the good metric, every other
    /// enabled member gets the constant bad metric, then reload + verify.
    /// Mutates the decision's `successful`/`error`/`duration_ms` audit
    /// fields to match the outcome.
    ///
    /// # Errors
    ///
    /// Returns the controller error alongside marking the decision failed.
    pub async fn apply(
        &self,
        decision: &mut Decision,
        snapshot: &RegistrySnapshot,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let started = self.clock.mono();
        let result = self.apply_inner(decision, snapshot, config, cancel).await;
        decision.duration_ms = self.clock.mono().since(started).as_millis() as u64;
        match &result {
            Ok(()) => {
                decision.successful = true;
                decision.error = None;
            }
            Err(e) => {
                decision.successful = false;
                decision.error = Some(e.to_string());
            }
        }
        result
    }

    async fn apply_inner(
        &self,
        decision: &Decision,
        snapshot: &RegistrySnapshot,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        if decision.dry_run {
            info!(
                to = %decision.to_member,
                "dry-run: decision recorded without touching the routing engine"
            );
            return Ok(());
        }

        let to = snapshot
            .get(&decision.to_member)
            .ok_or_else(|| ControllerError::EngineUnavailable(format!(
                "member {} vanished from the registry",
                decision.to_member
            )))?;

        let good = config.metric_good_for(&decision.to_member);
        self.engine
            .set_metric(&to.name, &to.interface, good)
            .await?;

        for member in &snapshot.members {
            if member.name == decision.to_member || !member.enabled || !member.detected {
                continue;
            }
            // Constant demoted metric. Never incremented from the previous
            // value.
            let bad = config.metric_bad_for(&member.name);
            self.engine
                .set_metric(&member.name, &member.interface, bad)
                .await?;
        }

        self.reload_with_retry(cancel).await?;

        match self.verify(&decision.to_member, cancel).await {
            Ok(()) => Ok(()),
            Err(ControllerError::VerifyMismatch { .. }) => {
                // One more reload, then the mismatch is final.
                warn!(to = %decision.to_member, "primary mismatch after reload, retrying once");
                self.reload_with_retry(cancel).await?;
                self.verify(&decision.to_member, cancel).await
            }
            Err(other) => Err(other),
        }
    }

    async fn reload_with_retry(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let policy = RetryPolicy::short(VERIFY_DEADLINE);
        run_with_retry(
            &policy,
            &self.clock,
            cancel,
            || self.engine.reload(),
            |e| !matches!(e, ControllerError::Cancelled),
        )
        .await
        .map_err(|e| match e.into_last() {
            Some(inner) => inner,
            None => ControllerError::Cancelled,
        })
    }

    /// Polls the engine until it reports the expected primary or the verify
    /// window closes.
    async fn verify(
        &self,
        expected: &MemberName,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let max_polls = (VERIFY_DEADLINE.as_millis() / VERIFY_POLL.as_millis()).max(1) as u32;
        let mut last_seen: Option<MemberName> = None;

        for _ in 0..max_polls {
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled);
            }
            match self.engine.active_primary().await {
                Ok(Some(active)) if &active == expected => {
                    debug!(primary = %expected, "routing engine confirmed primary");
                    return Ok(());
                }
                Ok(active) => last_seen = active,
                Err(e) => debug!(error = %e, "primary query failed during verify"),
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(ControllerError::Cancelled),
                () = self.clock.sleep(VERIFY_POLL) => {}
            }
        }

        Err(ControllerError::VerifyMismatch {
            expected: expected.clone(),
            got: last_seen,
        })
    }
}

/// mwan3-backed routing engine driven over ubus/uci.
///
/// The member name doubles as the mwan3 interface section name; the engine
/// keeps the last metric written per member so `active_primary` can map
/// mwan3's online set onto the preferred member.
#[derive(Debug)]
pub struct Mwan3Engine<R: CommandRunner + ?Sized> {
    runner: Arc<R>,
    ubus: Ubus<R>,
    metrics: Mutex<HashMap<MemberName, u32>>,
    call_deadline: Duration,
}

impl<R: CommandRunner + ?Sized> Mwan3Engine<R> {
    /// Creates an engine wrapper over the platform runner.
    pub fn new(runner: Arc<R>) -> Self {
        Self {
            ubus: Ubus::new(runner.clone()),
            runner,
            metrics: Mutex::new(HashMap::new()),
            call_deadline: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl<R: CommandRunner + ?Sized> RouteEngine for Mwan3Engine<R> {
    async fn set_metric(
        &self,
        member: &MemberName,
        _interface: &InterfaceName,
        metric: RouteMetric,
    ) -> Result<(), ControllerError> {
        let assignment = format!("mwan3.{}.metric={}", member, metric);
        self.runner
            .run("uci", &["set", &assignment], self.call_deadline)
            .await?;
        self.metrics.lock().insert(member.clone(), metric.into_inner());
        Ok(())
    }

    async fn reload(&self) -> Result<(), ControllerError> {
        self.runner
            .run("uci", &["commit", "mwan3"], self.call_deadline)
            .await?;
        self.runner
            .run("mwan3", &["reload"], self.call_deadline)
            .await?;
        Ok(())
    }

    async fn active_primary(&self) -> Result<Option<MemberName>, ControllerError> {
        let status = self
            .ubus
            .call("mwan3", "status", &json!({}), self.call_deadline)
            .await?;
        let Some(interfaces) = status.get("interfaces").and_then(|v| v.as_object()) else {
            return Ok(None);
        };
        let metrics = self.metrics.lock();
        let mut best: Option<(&MemberName, u32)> = None;
        for (member, metric) in metrics.iter() {
            let online = interfaces
                .get(member.as_str())
                .and_then(|i| i.get("status"))
                .and_then(|s| s.as_str())
                == Some("online");
            if online && best.is_none_or(|(_, m)| *metric < m) {
                best = Some((member, *metric));
            }
        }
        Ok(best.map(|(member, _)| member.clone()))
    }

    async fn inventory(&self) -> Result<Vec<DiscoveredMember>, ControllerError> {
        let dump = self
            .ubus
            .call("network.interface", "dump", &json!({}), self.call_deadline)
            .await?;
        let mut discovered = Vec::new();
        if let Some(entries) = dump.get("interface").and_then(|v| v.as_array()) {
            for entry in entries {
                let device = entry
                    .get("l3_device")
                    .or_else(|| entry.get("device"))
                    .and_then(|d| d.as_str());
                let up = entry.get("up").and_then(serde_json::Value::as_bool).unwrap_or(false);
                if let Some(device) = device {
                    if let Ok(interface) = InterfaceName::try_new(device.to_string()) {
                        discovered.push(DiscoveredMember { interface, up });
                    }
                }
            }
        }
        Ok(discovered)
    }
}
