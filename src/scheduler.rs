//! Scheduler: the tick loop and cancellation tree
//!
//! Owns the closed control loop: snapshot config and registry, fan collector
//! tasks out under a bounded worker pool, append samples, invoke the engine,
//! apply decisions through the controller, and record the audit trail. Late
//! collectors are cancelled and their members get sentinel samples; a panic
//! in a collector task is contained by the join set and never takes the
//! daemon down.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{CollectContext, CollectorSet};
use crate::config::{ConfigHandle, LogLevel, RawConfig, SetOutcome};
use crate::controller::Controller;
use crate::domain_types::MemberName;
use crate::engine::{DecisionEngine, ManualRequest, TickInput};
use crate::hotplug::HotplugEvent;
use crate::member::{MemberClass, Sample};
use crate::observability::{LogHandle, Notifier, NotifyKind};
use crate::persist::{self, PersistedState};
use crate::registry::{MemberEvent, MemberRegistry};
use crate::rpc::DaemonCommand;
use crate::telemetry::{StoreLimits, TelemetryStore};
use crate::time_provider::SharedTimeProvider;

/// Extra slack granted to the fan-in before late collectors are abandoned.
const GATHER_SLACK: Duration = Duration::from_millis(250);

/// Everything the scheduler needs, bundled to keep construction readable.
pub struct SchedulerParts {
    /// Live config handle.
    pub config: Arc<ConfigHandle>,
    /// Member registry.
    pub registry: Arc<MemberRegistry>,
    /// Telemetry store.
    pub store: Arc<TelemetryStore>,
    /// Per-class collectors.
    pub collectors: CollectorSet,
    /// Routing-engine controller.
    pub controller: Controller,
    /// Clock.
    pub clock: SharedTimeProvider,
    /// Rate-limited notifier.
    pub notifier: Arc<Notifier>,
    /// Root cancellation token.
    pub cancel: CancellationToken,
    /// RPC command channel.
    pub commands: mpsc::Receiver<DaemonCommand>,
    /// Hotplug event channel.
    pub hotplug: mpsc::Receiver<HotplugEvent>,
    /// Config source for `reload` actions.
    pub config_path: Option<PathBuf>,
    /// Persisted-state file.
    pub state_path: Option<PathBuf>,
    /// Live log-level handle.
    pub log_handle: Option<LogHandle>,
}

/// The tick driver.
pub struct Scheduler {
    config: Arc<ConfigHandle>,
    registry: Arc<MemberRegistry>,
    store: Arc<TelemetryStore>,
    collectors: CollectorSet,
    controller: Controller,
    clock: SharedTimeProvider,
    notifier: Arc<Notifier>,
    cancel: CancellationToken,
    commands: mpsc::Receiver<DaemonCommand>,
    hotplug: mpsc::Receiver<HotplugEvent>,
    config_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    log_handle: Option<LogHandle>,
    engine: DecisionEngine,
    current_log_level: LogLevel,
}

impl Scheduler {
    /// Builds the scheduler.
    #[must_use]
    pub fn new(parts: SchedulerParts) -> Self {
        let current_log_level = parts.config.snapshot().main.log_level;
        Self {
            config: parts.config,
            registry: parts.registry,
            store: parts.store,
            collectors: parts.collectors,
            controller: parts.controller,
            clock: parts.clock,
            notifier: parts.notifier,
            cancel: parts.cancel,
            commands: parts.commands,
            hotplug: parts.hotplug,
            config_path: parts.config_path,
            state_path: parts.state_path,
            log_handle: parts.log_handle,
            engine: DecisionEngine::new(),
            current_log_level,
        }
    }

    /// Runs until the root token is cancelled. Discovers members, restores
    /// persisted state, then drives the tick loop.
    pub async fn run(mut self) {
        self.reconcile_registry().await;
        if let Some(path) = self.state_path.clone() {
            if let Some(state) = persist::load(&path).await {
                info!(members = state.members.len(), "restoring persisted member state");
                self.registry
                    .restore(state.restore_entries(), self.clock.mono())
                    .await;
            }
        }

        let mut poll = self.config.snapshot().main.poll_interval.as_duration();
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_ms = poll.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_tick(None).await;
                    self.apply_live_config(&mut poll, &mut ticker);
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                Some(event) = self.hotplug.recv() => {
                    self.handle_hotplug(event).await;
                }
            }
        }

        self.persist_state().await;
        info!("scheduler stopped");
    }

    /// Picks up live-reloadable knobs at tick boundaries.
    fn apply_live_config(&mut self, poll: &mut Duration, ticker: &mut tokio::time::Interval) {
        let config = self.config.snapshot();

        let new_poll = config.main.poll_interval.as_duration();
        if new_poll != *poll {
            info!(
                old_ms = poll.as_millis() as u64,
                new_ms = new_poll.as_millis() as u64,
                "poll interval changed"
            );
            *poll = new_poll;
            *ticker = tokio::time::interval(new_poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        if config.main.log_level != self.current_log_level {
            if let Some(handle) = &self.log_handle {
                handle.set_level(config.main.log_level);
            }
            self.current_log_level = config.main.log_level;
        }

        self.store.reconfigure(StoreLimits::derive(
            new_poll,
            config.telemetry.retention,
            config.telemetry.bucket,
            config.telemetry.max_ram_mb.as_bytes(),
        ));
    }

    /// One full tick. Public so integration tests can drive the loop
    /// deterministically.
    pub async fn run_tick(&mut self, manual: Option<ManualRequest>) {
        let config = self.config.snapshot();
        if !config.main.enable {
            debug!("daemon disabled; tick skipped");
            return;
        }
        let now = self.clock.mono();
        let wall = self.clock.wall();
        let snapshot = self.registry.snapshot().await;
        let collect_deadline = config.main.poll_interval.as_duration() / 2;

        // Fan out one task per collectable member, bounded by the pool.
        let tick_cancel = self.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(config.main.worker_pool.into_inner()));
        let mut join_set: JoinSet<(MemberName, Sample)> = JoinSet::new();
        let mut expected: Vec<MemberName> = Vec::new();

        for member in snapshot.collectable() {
            let Some(collector) = self.collectors.for_class(member.class) else {
                warn!(member = %member.name, class = %member.class, "no collector for class");
                continue;
            };
            expected.push(member.name.clone());
            let member = member.clone();
            let config = Arc::clone(&config);
            let clock = Arc::clone(&self.clock);
            let cancel = tick_cancel.child_token();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let ctx = CollectContext {
                    config: &config,
                    clock: &clock,
                    cancel,
                    deadline: collect_deadline,
                };
                let sample = collector.collect(&member, &ctx).await;
                (member.name.clone(), sample)
            });
        }

        let mut samples: BTreeMap<MemberName, Sample> = BTreeMap::new();
        let gather = async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, sample)) => {
                        samples.insert(name, sample);
                    }
                    Err(join_error) if join_error.is_panic() => {
                        // Contained: the member gets a sentinel below and the
                        // worker is simply respawned next tick.
                        error!(error = %join_error, "collector task panicked");
                    }
                    Err(join_error) => debug!(error = %join_error, "collector task aborted"),
                }
            }
        };
        if tokio::time::timeout(collect_deadline + GATHER_SLACK, gather)
            .await
            .is_err()
        {
            warn!("tick deadline expired; abandoning late collectors");
            tick_cancel.cancel();
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        // Every collected member gets exactly one sample, even when its
        // collector timed out or crashed.
        for name in &expected {
            if !samples.contains_key(name) {
                samples.insert(
                    name.clone(),
                    Sample::sentinel(
                        name.clone(),
                        self.clock.mono(),
                        self.clock.wall(),
                        "collector abandoned (timeout or crash)".to_string(),
                    ),
                );
            }
        }

        // Bookkeeping: telemetry + error counters + eligibility.
        for (name, sample) in &samples {
            self.store.append(sample.clone());
            match self
                .registry
                .record_collection(name, !sample.is_sentinel(), now, &config.main)
                .await
            {
                Ok(events) => {
                    for event in events {
                        self.notify_member_event(&config, &event);
                    }
                }
                Err(e) => warn!(member = %name, error = %e, "collection bookkeeping failed"),
            }
        }

        // Engine evaluation on the post-bookkeeping snapshot.
        let snapshot = self.registry.snapshot().await;
        let input = TickInput {
            now,
            wall,
            config: &config,
            snapshot: &snapshot,
            store: &self.store,
            samples: &samples,
            manual: manual.as_ref(),
        };
        let outcome = self.engine.evaluate(&input);

        if let Some(mut decision) = outcome.decision {
            let apply_result = self
                .controller
                .apply(&mut decision, &snapshot, &config, &self.cancel)
                .await;
            self.engine
                .record_apply_result(&decision, self.clock.mono());

            if decision.successful {
                if let Err(e) = self
                    .registry
                    .apply_switch(
                        decision.from_member.as_ref(),
                        &decision.to_member,
                        now,
                        config.main.cooldown,
                    )
                    .await
                {
                    warn!(error = %e, "registry refused committed switch");
                }
                self.persist_state().await;

                let kind = self
                    .switch_kind(&snapshot_classes(&snapshot), &decision.from_member, &decision.to_member);
                self.notifier.notify(
                    &config.notifications,
                    kind,
                    &format!(
                        "primary switched {} -> {} ({})",
                        decision
                            .from_member
                            .as_ref()
                            .map_or_else(|| "none".to_string(), ToString::to_string),
                        decision.to_member,
                        decision.reason.detail
                    ),
                );
            } else {
                if let Err(e) = &apply_result {
                    warn!(error = %e, to = %decision.to_member, "decision application failed");
                }
                self.notifier.notify(
                    &config.notifications,
                    NotifyKind::ControllerFailure,
                    &format!(
                        "failed to switch to {}: {}",
                        decision.to_member,
                        decision.error.as_deref().unwrap_or("unknown error")
                    ),
                );
            }
            self.store.record_decision(decision);
        }
    }

    fn switch_kind(
        &self,
        classes: &BTreeMap<MemberName, MemberClass>,
        from: &Option<MemberName>,
        to: &MemberName,
    ) -> NotifyKind {
        let to_pref = classes.get(to).map(|c| c.default_preference());
        let from_pref = from
            .as_ref()
            .and_then(|f| classes.get(f))
            .map(|c| c.default_preference());
        match (from_pref, to_pref) {
            (Some(from), Some(to)) if to < from => NotifyKind::Restore,
            _ => NotifyKind::Failover,
        }
    }

    fn notify_member_event(&self, config: &crate::config::Config, event: &MemberEvent) {
        match event {
            MemberEvent::BecameIneligible(name) | MemberEvent::HardFailed(name) => {
                self.notifier.notify(
                    &config.notifications,
                    NotifyKind::MemberDown,
                    &format!("member {name} is no longer eligible"),
                );
            }
            MemberEvent::Recovered(name) => {
                self.notifier.notify(
                    &config.notifications,
                    NotifyKind::MemberUp,
                    &format!("member {name} recovered"),
                );
            }
        }
    }

    async fn handle_command(&mut self, command: DaemonCommand) {
        match command {
            DaemonCommand::Action(request) => {
                debug!(action = ?request.action, "running manual action tick");
                let manual = request.to_manual();
                self.run_tick(manual).await;
            }
            DaemonCommand::Reconcile => {
                self.reconcile_registry().await;
                self.run_tick(None).await;
            }
            DaemonCommand::ReloadConfig => self.reload_config_file().await,
        }
    }

    async fn handle_hotplug(&mut self, event: HotplugEvent) {
        info!(interface = %event.interface, up = event.up, "hotplug event");
        let (affected, primary_affected) = self
            .registry
            .interface_event(&event.interface, event.up)
            .await;
        if affected.is_empty() {
            return;
        }
        self.reconcile_registry().await;
        if primary_affected {
            // The primary just changed state under us; re-evaluate now.
            self.run_tick(None).await;
        }
    }

    async fn reload_config_file(&mut self) {
        let Some(path) = self.config_path.clone() else {
            warn!("reload requested but no config path configured");
            return;
        };
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed to read file");
                return;
            }
        };
        let parsed = if path.extension().is_some_and(|ext| ext == "json") {
            RawConfig::parse_json(&text)
        } else {
            RawConfig::parse_uci(&text)
        };
        match parsed.and_then(|raw| self.config.replace(raw)) {
            Ok(outcome) => {
                info!("config reloaded from file");
                if outcome == SetOutcome::NeedsReconcile {
                    self.reconcile_registry().await;
                }
            }
            Err(e) => warn!(error = %e, "config reload rejected; running config unchanged"),
        }
    }

    async fn reconcile_registry(&self) {
        let config = self.config.snapshot();
        let inventory = match self.controller.engine().inventory().await {
            Ok(inventory) => inventory,
            Err(e) => {
                debug!(error = %e, "routing engine inventory unavailable");
                Vec::new()
            }
        };
        self.registry.reconcile(&config.members, &inventory).await;
    }

    async fn persist_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let snapshot = self.registry.snapshot().await;
        let state = PersistedState::capture(&snapshot, self.clock.mono());
        if let Err(e) = persist::save(path, &state).await {
            warn!(error = %e, "failed to persist member state");
        }
    }
}

fn snapshot_classes(
    snapshot: &crate::registry::RegistrySnapshot,
) -> BTreeMap<MemberName, MemberClass> {
    snapshot
        .members
        .iter()
        .map(|m| (m.name.clone(), m.class))
        .collect()
}
