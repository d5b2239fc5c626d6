//! Shared scenario-test harness
//!
//! Builds a full scheduler over scripted collectors, a fake routing engine,
//! and the mock clock, so end-to-end failover scenarios run deterministically
//! without real network calls or real time.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use starfail::collector::{Collect, CollectContext, CollectorSet};
use starfail::config::{Config, ConfigHandle, RawConfig};
use starfail::controller::{Controller, ControllerError, RouteEngine};
use starfail::domain_types::{InterfaceName, MemberName, RouteMetric};
use starfail::member::{ClassExtras, CollectionMethod, Member, MemberClass, Sample};
use starfail::observability::{Notifier, NotifyKind, NotifySink};
use starfail::registry::{DiscoveredMember, MemberRegistry};
use starfail::scheduler::{Scheduler, SchedulerParts};
use starfail::telemetry::{StoreLimits, TelemetryStore};
use starfail::time_provider::{MockTimeProvider, MonoTime, SharedTimeProvider};

/// Scripted link quality for one member.
#[derive(Debug, Clone)]
pub struct MemberSpec {
    pub latency_ms: f64,
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub extras: ClassExtras,
    pub method: CollectionMethod,
    pub error: Option<String>,
}

impl MemberSpec {
    pub fn clean(latency_ms: f64, loss_pct: f64) -> Self {
        Self {
            latency_ms,
            loss_pct,
            jitter_ms: 2.0,
            extras: ClassExtras::None,
            method: CollectionMethod::Primary,
            error: None,
        }
    }

    /// Same link quality, but collected through the ping fallback.
    pub fn ping_fallback(latency_ms: f64, loss_pct: f64, error: &str) -> Self {
        Self {
            method: CollectionMethod::PingFallback,
            error: Some(error.to_string()),
            ..Self::clean(latency_ms, loss_pct)
        }
    }
}

/// Shared mutable network conditions the scripted collectors read.
#[derive(Debug, Default)]
pub struct Conditions {
    specs: Mutex<HashMap<String, MemberSpec>>,
    panicking: Mutex<Vec<String>>,
}

impl Conditions {
    pub fn set(&self, member: &str, spec: MemberSpec) {
        self.specs.lock().insert(member.to_string(), spec);
    }

    /// Makes the member's collector panic, to exercise containment.
    pub fn set_panicking(&self, member: &str, on: bool) {
        let mut panicking = self.panicking.lock();
        panicking.retain(|m| m != member);
        if on {
            panicking.push(member.to_string());
        }
    }

    fn get(&self, member: &str) -> Option<MemberSpec> {
        self.specs.lock().get(member).cloned()
    }

    fn is_panicking(&self, member: &str) -> bool {
        self.panicking.lock().iter().any(|m| m == member)
    }
}

/// Collector that replays the scripted conditions.
#[derive(Debug)]
pub struct ScriptedCollector {
    class: MemberClass,
    conditions: Arc<Conditions>,
}

#[async_trait]
impl Collect for ScriptedCollector {
    fn class(&self) -> MemberClass {
        self.class
    }

    async fn collect(&self, member: &Member, ctx: &CollectContext<'_>) -> Sample {
        assert!(
            !self.conditions.is_panicking(member.name.as_str()),
            "scripted collector panic for {}",
            member.name
        );
        match self.conditions.get(member.name.as_str()) {
            Some(spec) => Sample {
                member: member.name.clone(),
                at_mono: ctx.clock.mono(),
                at_wall: ctx.clock.wall(),
                latency_ms: spec.latency_ms,
                loss_pct: spec.loss_pct,
                jitter_ms: spec.jitter_ms,
                signal_dbm: None,
                extras: spec.extras,
                method: spec.method,
                error: spec.error,
                collected_in_ms: 1,
            },
            None => Sample::sentinel(
                member.name.clone(),
                ctx.clock.mono(),
                ctx.clock.wall(),
                "no scripted conditions".to_string(),
            ),
        }
    }
}

/// Routing engine double. When `honest` it reports the lowest-metric member
/// as active; otherwise it keeps reporting `stuck_on` forever.
#[derive(Debug)]
pub struct FakeRouteEngine {
    pub metric_log: Mutex<Vec<(String, u32)>>,
    pub reloads: AtomicU32,
    metrics: Mutex<HashMap<String, u32>>,
    honest: bool,
    stuck_on: Option<String>,
}

impl FakeRouteEngine {
    pub fn honest() -> Self {
        Self {
            metric_log: Mutex::new(Vec::new()),
            reloads: AtomicU32::new(0),
            metrics: Mutex::new(HashMap::new()),
            honest: true,
            stuck_on: None,
        }
    }

    pub fn stuck(on: &str) -> Self {
        Self {
            honest: false,
            stuck_on: Some(on.to_string()),
            ..Self::honest()
        }
    }
}

#[async_trait]
impl RouteEngine for FakeRouteEngine {
    async fn set_metric(
        &self,
        member: &MemberName,
        _interface: &InterfaceName,
        metric: RouteMetric,
    ) -> Result<(), ControllerError> {
        self.metric_log
            .lock()
            .push((member.to_string(), metric.into_inner()));
        self.metrics
            .lock()
            .insert(member.to_string(), metric.into_inner());
        Ok(())
    }

    async fn reload(&self) -> Result<(), ControllerError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn active_primary(&self) -> Result<Option<MemberName>, ControllerError> {
        if !self.honest {
            return Ok(self
                .stuck_on
                .as_ref()
                .map(|name| MemberName::try_new(name.clone()).unwrap()));
        }
        let metrics = self.metrics.lock();
        Ok(metrics
            .iter()
            .min_by_key(|(_, metric)| **metric)
            .map(|(name, _)| MemberName::try_new(name.clone()).unwrap()))
    }

    async fn inventory(&self) -> Result<Vec<DiscoveredMember>, ControllerError> {
        Ok(Vec::new())
    }
}

/// Notification sink that counts deliveries per kind.
#[derive(Debug, Default)]
pub struct CountingSink {
    delivered: Mutex<Vec<(NotifyKind, String)>>,
}

impl CountingSink {
    pub fn count(&self, kind: NotifyKind) -> usize {
        self.delivered.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl NotifySink for CountingSink {
    fn deliver(&self, kind: NotifyKind, message: &str) {
        self.delivered.lock().push((kind, message.to_string()));
    }
}

/// Two-member config: starlink primary-candidate plus one cellular backup.
pub const TWO_MEMBER_UCI: &str = r"
config starfail 'main'
	option poll_interval_ms '1000'
	option switch_margin '10'
	option fail_threshold '3'
	option fail_min_duration_s '20'
	option restore_min_duration_s '300'
	option cooldown_seconds '60'

config member 'member_starlink_any'
	option class 'starlink'
	option interface 'wan'

config member 'member_cellular_sim1'
	option class 'cellular'
	option interface 'wwan0'
";

/// A fully wired scheduler over test doubles.
pub struct Harness {
    pub scheduler: Scheduler,
    pub clock: Arc<MockTimeProvider>,
    pub config: Arc<ConfigHandle>,
    pub registry: Arc<MemberRegistry>,
    pub store: Arc<TelemetryStore>,
    pub conditions: Arc<Conditions>,
    pub engine: Arc<FakeRouteEngine>,
    pub sink: Arc<CountingSink>,
}

impl Harness {
    /// Advances the clock one second and runs one tick, `ticks` times.
    pub async fn run_seconds(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.clock.advance(Duration::from_secs(1));
            self.scheduler.run_tick(None).await;
        }
    }

    /// Makes `member` primary without involving the controller, as if a
    /// previous run had selected it.
    pub async fn seed_primary(&self, member: &str) {
        self.registry
            .apply_switch(
                None,
                &MemberName::try_new(member.to_string()).unwrap(),
                MonoTime::ZERO,
                Duration::ZERO,
            )
            .await
            .unwrap();
    }

    /// Decisions excluding the initial discovery selection.
    pub fn switch_decisions(&self) -> Vec<starfail::member::Decision> {
        self.store
            .events(usize::MAX)
            .into_iter()
            .filter(|d| d.trigger != starfail::member::DecisionTrigger::Discovery)
            .collect()
    }
}

/// Builds the harness. `route_engine` lets tests inject a dishonest engine.
pub async fn build_harness(uci: &str, route_engine: FakeRouteEngine) -> Harness {
    let raw = RawConfig::parse_uci(uci).expect("test config parses");
    let config = Arc::new(ConfigHandle::new(raw).expect("test config validates"));
    let snapshot: Arc<Config> = config.snapshot();

    let clock = Arc::new(MockTimeProvider::new());
    let shared_clock: SharedTimeProvider = clock.clone();

    let conditions = Arc::new(Conditions::default());
    let collectors = CollectorSet::new(vec![
        Arc::new(ScriptedCollector {
            class: MemberClass::Starlink,
            conditions: conditions.clone(),
        }) as Arc<dyn Collect>,
        Arc::new(ScriptedCollector {
            class: MemberClass::Cellular,
            conditions: conditions.clone(),
        }),
        Arc::new(ScriptedCollector {
            class: MemberClass::Wifi,
            conditions: conditions.clone(),
        }),
        Arc::new(ScriptedCollector {
            class: MemberClass::Lan,
            conditions: conditions.clone(),
        }),
    ]);

    let store = Arc::new(TelemetryStore::new(StoreLimits::derive(
        snapshot.main.poll_interval.as_duration(),
        snapshot.telemetry.retention,
        snapshot.telemetry.bucket,
        snapshot.telemetry.max_ram_mb.as_bytes(),
    )));
    let registry = Arc::new(MemberRegistry::new());
    registry.reconcile(&snapshot.members, &[]).await;

    let engine = Arc::new(route_engine);
    let controller = Controller::new(engine.clone(), shared_clock.clone());
    let sink = Arc::new(CountingSink::default());
    let notifier = Arc::new(Notifier::new(sink.clone(), shared_clock.clone()));

    let (_command_tx, command_rx) = mpsc::channel(4);
    let (_hotplug_tx, hotplug_rx) = starfail::hotplug::channel();

    let scheduler = Scheduler::new(SchedulerParts {
        config: config.clone(),
        registry: registry.clone(),
        store: store.clone(),
        collectors,
        controller,
        clock: shared_clock,
        notifier,
        cancel: CancellationToken::new(),
        commands: command_rx,
        hotplug: hotplug_rx,
        config_path: None,
        state_path: None,
        log_handle: None,
    });

    Harness {
        scheduler,
        clock,
        config,
        registry,
        store,
        conditions,
        engine,
        sink,
    }
}
