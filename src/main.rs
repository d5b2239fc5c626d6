//! starfaild - the multi-WAN failover daemon binary
//!
//! Wires the platform seams (ubus, ping, mwan3, the dish gRPC channel) into
//! the control loop and runs it until SIGTERM/SIGINT, with a bounded grace
//! period for in-flight work.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use starfail::collector::cellular::{
    CellularCollector, ModemService, ProcCounterSource, UbusGsmService, UbusMobiledService,
};
use starfail::collector::dish::GrpcDishClient;
use starfail::collector::lan::LanCollector;
use starfail::collector::ping::{Pinger, SystemPinger};
use starfail::collector::starlink::StarlinkCollector;
use starfail::collector::wifi::{UbusIwinfo, WifiCollector};
use starfail::collector::{Collect, CollectorSet};
use starfail::config::{ConfigHandle, RawConfig};
use starfail::controller::{Controller, Mwan3Engine};
use starfail::observability::{LogSink, Notifier, init_logging};
use starfail::platform::SystemCommandRunner;
use starfail::registry::MemberRegistry;
use starfail::scheduler::{Scheduler, SchedulerParts};
use starfail::telemetry::{StoreLimits, TelemetryStore};
use starfail::time_provider::production_time_provider;

/// Multi-WAN failover daemon for Starlink + cellular routers.
#[derive(Debug, Parser)]
#[command(name = "starfaild", version, about)]
struct Args {
    /// Configuration file (uci export shape, or JSON with a .json extension).
    #[arg(short, long, default_value = "/etc/config/starfail")]
    config: PathBuf,

    /// Member state file surviving restarts. Disabled when omitted.
    #[arg(long, default_value = "/var/lib/starfail/state.json")]
    state_file: PathBuf,

    /// Log decisions without touching the routing engine, regardless of the
    /// configured dry_run flag.
    #[arg(long)]
    dry_run: bool,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and validate configuration before anything else.
    let text = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let raw = if args.config.extension().is_some_and(|ext| ext == "json") {
        RawConfig::parse_json(&text)?
    } else {
        RawConfig::parse_uci(&text)?
    };
    let config = Arc::new(ConfigHandle::new(raw).context("invalid configuration")?);
    if args.dry_run {
        config
            .set("main.dry_run", "1")
            .context("forcing dry-run")?;
    }

    let snapshot = config.snapshot();
    let log_handle = init_logging(snapshot.main.log_level, args.json_logs);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        members = snapshot.members.len(),
        dry_run = snapshot.main.dry_run,
        "starfaild starting"
    );

    let clock = production_time_provider();
    let runner = Arc::new(SystemCommandRunner);
    let pinger: Arc<dyn Pinger> = Arc::new(SystemPinger::new(runner.clone()));

    // One HTTP/2 channel to the dish, shared by every Starlink collection.
    let dish = GrpcDishClient::connect_lazy(
        snapshot.starlink.dish_ip,
        snapshot.starlink.dish_port.into_inner(),
    )
    .map_err(|e| anyhow::anyhow!("dish client: {e}"))?;

    let modem_providers: Vec<Arc<dyn ModemService>> = vec![
        Arc::new(UbusGsmService::new(runner.clone())),
        Arc::new(UbusMobiledService::new(runner.clone())),
    ];
    let collectors = CollectorSet::new(vec![
        Arc::new(StarlinkCollector::new(Arc::new(dish), pinger.clone())) as Arc<dyn Collect>,
        Arc::new(CellularCollector::new(
            modem_providers,
            Arc::new(ProcCounterSource),
            pinger.clone(),
        )),
        Arc::new(WifiCollector::new(
            Arc::new(UbusIwinfo::new(runner.clone())),
            pinger.clone(),
        )),
        Arc::new(LanCollector::new(pinger)),
    ]);

    let store = Arc::new(TelemetryStore::new(StoreLimits::derive(
        snapshot.main.poll_interval.as_duration(),
        snapshot.telemetry.retention,
        snapshot.telemetry.bucket,
        snapshot.telemetry.max_ram_mb.as_bytes(),
    )));
    let registry = Arc::new(MemberRegistry::new());
    let controller = Controller::new(Arc::new(Mwan3Engine::new(runner)), clock.clone());
    let notifier = Arc::new(Notifier::new(Arc::new(LogSink), clock.clone()));

    let cancel = CancellationToken::new();
    let (command_tx, command_rx) = mpsc::channel(16);
    let (_hotplug_tx, hotplug_rx) = starfail::hotplug::channel();

    // The RPC surface is handed to the host bus integration; keeping it here
    // keeps the command channel alive for its lifetime.
    let _rpc = starfail::rpc::RpcSurface::new(
        config.clone(),
        registry.clone(),
        store.clone(),
        command_tx,
        clock.clone(),
    );

    let scheduler = Scheduler::new(SchedulerParts {
        config: config.clone(),
        registry,
        store,
        collectors,
        controller,
        clock,
        notifier,
        cancel: cancel.clone(),
        commands: command_rx,
        hotplug: hotplug_rx,
        config_path: Some(args.config.clone()),
        state_path: Some(args.state_file.clone()),
        log_handle: Some(log_handle),
    });
    let scheduler_task = tokio::spawn(scheduler.run());

    // Shutdown on SIGINT/SIGTERM: cancel the root token, then wait out the
    // grace period for in-flight decisions.
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    cancel.cancel();

    let grace = config.snapshot().main.shutdown_grace;
    if tokio::time::timeout(grace, scheduler_task).await.is_err() {
        warn!(grace_s = grace.as_secs(), "grace period expired, exiting anyway");
    }

    info!("starfaild stopped");
    Ok(())
}
