//! RPC effect surface
//!
//! The bus transport itself (ubus bind, JSON-RPC framing) is host
//! integration; this module implements the effects the methods have on the
//! daemon: structured status/members/metrics/events reads, manual actions
//! delivered to the scheduler over a command channel, and `config.get` /
//! `config.set` against the live config handle.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{ConfigError, ConfigHandle, SetOutcome};
use crate::domain_types::MemberName;
use crate::engine::{ManualAction, ManualRequest};
use crate::registry::MemberRegistry;
use crate::telemetry::TelemetryStore;
use crate::time_provider::SharedTimeProvider;

/// Actions accepted by the `action` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Switch away from the current primary.
    Failover,
    /// Switch back to the most preferred eligible member.
    Restore,
    /// Switch to the named member.
    Switch,
    /// Re-evaluate immediately.
    Recheck,
    /// Re-read configuration from its source.
    Reload,
    /// Dry evaluation: run a tick without special handling.
    Test,
}

/// One `action` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// What to do.
    pub action: ActionKind,
    /// Target member for `switch`.
    #[serde(default)]
    pub member: Option<MemberName>,
    /// Bypass cooldowns.
    #[serde(default)]
    pub force: bool,
}

impl ActionRequest {
    /// The engine-facing manual request, when the action maps to one.
    #[must_use]
    pub fn to_manual(&self) -> Option<ManualRequest> {
        let action = match self.action {
            ActionKind::Failover => ManualAction::Failover,
            ActionKind::Restore => ManualAction::Restore,
            ActionKind::Switch => ManualAction::Switch(self.member.clone()?),
            ActionKind::Recheck | ActionKind::Test => ManualAction::Recheck,
            ActionKind::Reload => return None,
        };
        Some(ManualRequest {
            action,
            force: self.force,
        })
    }
}

/// Commands the RPC surface sends to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Run a manual action on the next out-of-band tick.
    Action(ActionRequest),
    /// Member set changed; reconcile the registry.
    Reconcile,
    /// Re-read the config source and apply it.
    ReloadConfig,
}

/// RPC errors, structured for the bus.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Config get/set failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The named member does not exist.
    #[error("member not found: {0}")]
    MemberNotFound(MemberName),

    /// The scheduler command queue is gone (shutdown in progress).
    #[error("daemon is shutting down")]
    ShuttingDown,
}

/// Result alias for RPC methods.
pub type Result<T> = std::result::Result<T, RpcError>;

/// The method implementations behind the bus surface.
#[derive(Debug)]
pub struct RpcSurface {
    config: Arc<ConfigHandle>,
    registry: Arc<MemberRegistry>,
    store: Arc<TelemetryStore>,
    commands: mpsc::Sender<DaemonCommand>,
    clock: SharedTimeProvider,
}

impl RpcSurface {
    /// Creates the surface.
    pub fn new(
        config: Arc<ConfigHandle>,
        registry: Arc<MemberRegistry>,
        store: Arc<TelemetryStore>,
        commands: mpsc::Sender<DaemonCommand>,
        clock: SharedTimeProvider,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            commands,
            clock,
        }
    }

    /// `status`: daemon-level summary.
    pub async fn status(&self) -> Value {
        let snapshot = self.registry.snapshot().await;
        let config = self.config.snapshot();
        json!({
            "enabled": config.main.enable,
            "dry_run": config.main.dry_run,
            "primary": snapshot.primary().map(|m| m.name.clone()),
            "members_total": snapshot.members.len(),
            "members_eligible": snapshot.eligible().count(),
            "telemetry_ram_bytes": self.store.ram_bytes(),
            "generation": snapshot.generation,
        })
    }

    /// `members`: the full member list.
    pub async fn members(&self) -> Value {
        let snapshot = self.registry.snapshot().await;
        json!({ "members": snapshot.members })
    }

    /// `metrics {member, limit}`: recent samples for one member.
    pub async fn metrics(&self, member: &MemberName, limit: usize) -> Result<Value> {
        let snapshot = self.registry.snapshot().await;
        if snapshot.get(member).is_none() {
            return Err(RpcError::MemberNotFound(member.clone()));
        }
        let mut samples =
            self.store
                .window(member, Duration::from_secs(24 * 3600), self.clock.mono());
        if samples.len() > limit {
            samples.drain(..samples.len() - limit);
        }
        Ok(json!({ "member": member, "samples": samples }))
    }

    /// `events {limit}`: recent decisions, newest first.
    #[must_use]
    pub fn events(&self, limit: usize) -> Value {
        json!({ "events": self.store.events(limit) })
    }

    /// `action`: validates and enqueues a manual action.
    pub async fn action(&self, request: ActionRequest) -> Result<Value> {
        if request.action == ActionKind::Switch {
            let Some(member) = &request.member else {
                return Err(RpcError::BadRequest("switch requires a member".to_string()));
            };
            let snapshot = self.registry.snapshot().await;
            if snapshot.get(member).is_none() {
                return Err(RpcError::MemberNotFound(member.clone()));
            }
        }
        info!(action = ?request.action, member = ?request.member, "rpc action accepted");
        let command = if request.action == ActionKind::Reload {
            DaemonCommand::ReloadConfig
        } else {
            DaemonCommand::Action(request)
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| RpcError::ShuttingDown)?;
        Ok(json!({ "accepted": true }))
    }

    /// `config.get {key}`: canonicalized value of one key, or the whole raw
    /// config when `key` is `None`.
    pub fn config_get(&self, key: Option<&str>) -> Result<Value> {
        match key {
            Some(key) => {
                let value = self.config.get(key)?;
                Ok(json!({ "key": key, "value": value }))
            }
            None => {
                let exported = self.config.export()?;
                Ok(serde_json::from_str(&exported).map_err(ConfigError::from)?)
            }
        }
    }

    /// `config.set {key, value}`: validate-and-swap one key. Member-set
    /// changes additionally trigger a registry reconcile.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<Value> {
        let outcome = self.config.set(key, value)?;
        if outcome == SetOutcome::NeedsReconcile {
            self.commands
                .send(DaemonCommand::Reconcile)
                .await
                .map_err(|_| RpcError::ShuttingDown)?;
        }
        Ok(json!({ "applied": true, "needs_reconcile": outcome == SetOutcome::NeedsReconcile }))
    }

    /// `export {member?, hours?}`: samples and aggregates for offline
    /// analysis.
    pub async fn export(&self, member: Option<&MemberName>, hours: u64) -> Result<Value> {
        let snapshot = self.registry.snapshot().await;
        let members: Vec<MemberName> = match member {
            Some(member) => {
                if snapshot.get(member).is_none() {
                    return Err(RpcError::MemberNotFound(member.clone()));
                }
                vec![member.clone()]
            }
            None => snapshot.members.iter().map(|m| m.name.clone()).collect(),
        };
        let window = Duration::from_secs(hours.max(1) * 3600);
        let now = self.clock.mono();
        let mut export = serde_json::Map::new();
        for name in members {
            export.insert(
                name.to_string(),
                json!({
                    "samples": self.store.window(&name, window, now),
                    "buckets": self.store.aggregate(&name),
                }),
            );
        }
        Ok(Value::Object(export))
    }

    /// `notify {message, priority}`: delivery is external; the effect here
    /// is a structured log line the host integration can forward.
    #[must_use]
    pub fn notify(&self, message: &str, priority: i64) -> Value {
        info!(message, priority, "operator notification requested");
        json!({ "accepted": true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::telemetry::StoreLimits;
    use crate::time_provider::MockTimeProvider;

    const UCI: &str = r"
config starfail 'main'
	option poll_interval_ms '1000'

config member 'member_starlink_any'
	option class 'starlink'
	option interface 'wan'

config member 'member_cellular_sim1'
	option class 'cellular'
	option interface 'wwan0'
";

    async fn surface() -> (RpcSurface, mpsc::Receiver<DaemonCommand>) {
        let config = Arc::new(ConfigHandle::new(RawConfig::parse_uci(UCI).unwrap()).unwrap());
        let registry = Arc::new(MemberRegistry::new());
        registry.reconcile(&config.snapshot().members, &[]).await;
        let store = Arc::new(TelemetryStore::new(StoreLimits::derive(
            Duration::from_secs(1),
            Duration::from_secs(600),
            Duration::from_secs(300),
            16 * 1024 * 1024,
        )));
        let (tx, rx) = mpsc::channel(8);
        let clock: SharedTimeProvider = Arc::new(MockTimeProvider::new());
        (
            RpcSurface::new(config, registry, store, tx, clock),
            rx,
        )
    }

    fn name(s: &str) -> MemberName {
        MemberName::try_new(s.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_member_counts() {
        let (surface, _rx) = surface().await;
        let status = surface.status().await;
        assert_eq!(status["members_total"], 2);
        assert_eq!(status["primary"], Value::Null);
    }

    #[tokio::test]
    async fn test_action_switch_requires_known_member() {
        let (surface, _rx) = surface().await;
        let err = surface
            .action(ActionRequest {
                action: ActionKind::Switch,
                member: Some(name("nope")),
                force: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MemberNotFound(_)));

        let err = surface
            .action(ActionRequest {
                action: ActionKind::Switch,
                member: None,
                force: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_action_enqueues_command() {
        let (surface, mut rx) = surface().await;
        surface
            .action(ActionRequest {
                action: ActionKind::Failover,
                member: None,
                force: true,
            })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            DaemonCommand::Action(request) => {
                assert_eq!(request.action, ActionKind::Failover);
                assert!(request.force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reload_action_maps_to_reload_command() {
        let (surface, mut rx) = surface().await;
        surface
            .action(ActionRequest {
                action: ActionKind::Reload,
                member: None,
                force: false,
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), DaemonCommand::ReloadConfig);
    }

    #[tokio::test]
    async fn test_config_set_member_key_requests_reconcile() {
        let (surface, mut rx) = surface().await;
        surface
            .config_set("member_cellular_sim1.enabled", "0")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), DaemonCommand::Reconcile);
    }

    #[tokio::test]
    async fn test_config_get_set_round_trip() {
        let (surface, _rx) = surface().await;
        surface.config_set("main.switch_margin", "7.5").await.unwrap();
        let got = surface.config_get(Some("main.switch_margin")).unwrap();
        assert_eq!(got["value"], "7.5");
    }

    #[tokio::test]
    async fn test_switch_action_maps_to_manual_request() {
        let request = ActionRequest {
            action: ActionKind::Switch,
            member: Some(name("cellular_sim1")),
            force: false,
        };
        let manual = request.to_manual().unwrap();
        assert_eq!(manual.action, ManualAction::Switch(name("cellular_sim1")));

        let reload = ActionRequest {
            action: ActionKind::Reload,
            member: None,
            force: false,
        };
        assert!(reload.to_manual().is_none());
    }
}
