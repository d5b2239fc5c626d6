//! Cellular collector
//!
//! Signal comes from the platform's modem service; latency, loss, and jitter
//! come from the ping burst. The signal ladder degrades provider by
//! provider: primary modem service, any secondary provider, then a
//! counters-only estimate from `/proc/net/dev`. Each step is recorded in the
//! sample's `collection_method`.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain_types::InterfaceName;
use crate::member::{CellularExtras, ClassExtras, CollectionMethod, Member, MemberClass, Sample};
use crate::platform::{CommandRunner, Ubus, interface_counters};
use crate::retry::{RetryPolicy, run_with_retry};

use super::ping::Pinger;
use super::{CollectContext, CollectorError, PING_BURST_PACKETS, ping_fallback};

/// Signal readings from a modem service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModemSignal {
    /// RSRP, dBm.
    pub rsrp_dbm: Option<f64>,
    /// RSRQ, dB.
    pub rsrq_db: Option<f64>,
    /// SINR, dB.
    pub sinr_db: Option<f64>,
    /// Radio technology label.
    pub technology: Option<String>,
    /// Operator name.
    pub operator: Option<String>,
    /// Roaming flag.
    pub roaming: bool,
}

/// A modem signal provider. Providers are probed in order until one answers.
#[async_trait]
pub trait ModemService: Send + Sync + std::fmt::Debug {
    /// Short provider name for `collection_method` bookkeeping and logs.
    fn name(&self) -> &'static str;

    /// Queries signal for the modem behind `slot`.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the service is absent or the modem is not
    /// answering.
    async fn signal(&self, slot: Option<u8>, deadline: Duration)
    -> Result<ModemSignal, CollectorError>;
}

/// Primary provider: the `gsm` ubus service.
#[derive(Debug)]
pub struct UbusGsmService<R: CommandRunner + ?Sized> {
    ubus: Ubus<R>,
}

impl<R: CommandRunner + ?Sized> UbusGsmService<R> {
    /// Wraps the platform runner.
    pub fn new(runner: Arc<R>) -> Self {
        Self {
            ubus: Ubus::new(runner),
        }
    }
}

fn number(value: Option<&serde_json::Value>) -> Option<f64> {
    value.and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

#[async_trait]
impl<R: CommandRunner + ?Sized> ModemService for UbusGsmService<R> {
    fn name(&self) -> &'static str {
        "gsm"
    }

    async fn signal(
        &self,
        slot: Option<u8>,
        deadline: Duration,
    ) -> Result<ModemSignal, CollectorError> {
        let object = format!("gsm.modem{}", slot.unwrap_or(0));
        let reply = self
            .ubus
            .call(&object, "info", &json!({}), deadline)
            .await?;
        if reply.is_null() {
            return Err(CollectorError::Unavailable(format!("{object} returned nothing")));
        }
        Ok(ModemSignal {
            rsrp_dbm: number(reply.get("rsrp")),
            rsrq_db: number(reply.get("rsrq")),
            sinr_db: number(reply.get("sinr")),
            technology: reply
                .get("net_mode")
                .or_else(|| reply.get("technology"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            operator: reply
                .get("operator")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            roaming: reply
                .get("roaming")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Secondary provider: the `mobiled` ubus service found on some firmwares.
#[derive(Debug)]
pub struct UbusMobiledService<R: CommandRunner + ?Sized> {
    ubus: Ubus<R>,
}

impl<R: CommandRunner + ?Sized> UbusMobiledService<R> {
    /// Wraps the platform runner.
    pub fn new(runner: Arc<R>) -> Self {
        Self {
            ubus: Ubus::new(runner),
        }
    }
}

#[async_trait]
impl<R: CommandRunner + ?Sized> ModemService for UbusMobiledService<R> {
    fn name(&self) -> &'static str {
        "mobiled"
    }

    async fn signal(
        &self,
        slot: Option<u8>,
        deadline: Duration,
    ) -> Result<ModemSignal, CollectorError> {
        let reply = self
            .ubus
            .call(
                "mobiled.network",
                "serving_system",
                &json!({ "dev_idx": slot.unwrap_or(0) }),
                deadline,
            )
            .await?;
        if reply.is_null() {
            return Err(CollectorError::Unavailable("mobiled returned nothing".to_string()));
        }
        Ok(ModemSignal {
            rsrp_dbm: number(reply.get("rsrp")),
            rsrq_db: number(reply.get("rsrq")),
            sinr_db: number(reply.get("snr")),
            technology: reply
                .get("radio_interface")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            operator: reply
                .get("network_name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            roaming: reply
                .get("roaming_state")
                .and_then(|v| v.as_str())
                .is_some_and(|s| s != "home"),
        })
    }
}

/// Reads interface byte counters, abstracted for tests.
#[async_trait]
pub trait CounterSource: Send + Sync + std::fmt::Debug {
    /// rx/tx byte counters for an interface.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the interface has no counters.
    async fn counters(&self, interface: &InterfaceName) -> Result<(u64, u64), CollectorError>;
}

/// `/proc/net/dev`-backed counter source.
#[derive(Debug, Default)]
pub struct ProcCounterSource;

#[async_trait]
impl CounterSource for ProcCounterSource {
    async fn counters(&self, interface: &InterfaceName) -> Result<(u64, u64), CollectorError> {
        interface_counters(interface).await.map_err(CollectorError::from)
    }
}

/// Collector for cellular members.
#[derive(Debug)]
pub struct CellularCollector {
    providers: Vec<Arc<dyn ModemService>>,
    counters: Arc<dyn CounterSource>,
    pinger: Arc<dyn Pinger>,
}

impl CellularCollector {
    /// Creates the collector with a provider ladder (probed in order).
    pub fn new(
        providers: Vec<Arc<dyn ModemService>>,
        counters: Arc<dyn CounterSource>,
        pinger: Arc<dyn Pinger>,
    ) -> Self {
        Self {
            providers,
            counters,
            pinger,
        }
    }

    /// Probes the provider ladder. Returns the signal, which rung answered
    /// (0 = primary), and the errors of the rungs above it. Each provider
    /// query runs through the shared retry runner.
    async fn signal_ladder(
        &self,
        slot: Option<u8>,
        ctx: &CollectContext<'_>,
        deadline: Duration,
    ) -> (Option<(ModemSignal, usize)>, Vec<String>) {
        let policy = RetryPolicy::short(deadline);
        let mut errors = Vec::new();
        for (rung, provider) in self.providers.iter().enumerate() {
            let result = run_with_retry(
                &policy,
                ctx.clock,
                &ctx.cancel,
                || provider.signal(slot, deadline),
                |e| !matches!(e, CollectorError::Cancelled),
            )
            .await;
            match result {
                Ok(signal) => return (Some((signal, rung)), errors),
                Err(e) => {
                    let e = CollectorError::from(e);
                    debug!(provider = provider.name(), error = %e, "modem provider failed");
                    errors.push(format!("{}: {e}", provider.name()));
                }
            }
        }
        (None, errors)
    }
}

#[async_trait]
impl super::Collect for CellularCollector {
    fn class(&self) -> MemberClass {
        MemberClass::Cellular
    }

    async fn collect(&self, member: &Member, ctx: &CollectContext<'_>) -> Sample {
        let started = ctx.clock.mono();
        let slot = member.sim_slot;
        let provider_deadline = ctx.deadline / 2;

        let (signal, signal_errors) = self.signal_ladder(slot, ctx, provider_deadline).await;
        let counters = self.counters.counters(&member.interface).await.ok();

        let anchors = ctx.anchors(&member.name);
        let ping = self
            .pinger
            .burst(&member.interface, &anchors, PING_BURST_PACKETS, ctx.deadline)
            .await;

        match (signal, ping) {
            (Some((signal, rung)), Ok(stats)) => {
                let method = if rung == 0 {
                    CollectionMethod::Primary
                } else {
                    CollectionMethod::Degraded
                };
                let error = (!signal_errors.is_empty()).then(|| signal_errors.join("; "));
                let extras = CellularExtras {
                    rsrp_dbm: signal.rsrp_dbm,
                    rsrq_db: signal.rsrq_db,
                    sinr_db: signal.sinr_db,
                    technology: signal.technology,
                    operator: signal.operator,
                    roaming: signal.roaming,
                    rx_bytes: counters.map(|(rx, _)| rx),
                    tx_bytes: counters.map(|(_, tx)| tx),
                };
                Sample {
                    member: member.name.clone(),
                    at_mono: ctx.clock.mono(),
                    at_wall: ctx.clock.wall(),
                    latency_ms: stats.latency_ms,
                    loss_pct: stats.loss_pct,
                    jitter_ms: stats.jitter_ms,
                    signal_dbm: extras.rsrp_dbm,
                    extras: ClassExtras::Cellular(extras),
                    method,
                    error,
                    collected_in_ms: ctx.clock.mono().since(started).as_millis() as u64,
                }
            }
            (None, Ok(stats)) => {
                // No modem service answered. Counters alone cannot measure
                // quality, so the sample is a counters-annotated estimate on
                // top of the ping result.
                let method = if counters.is_some() {
                    CollectionMethod::Estimated
                } else {
                    CollectionMethod::PingFallback
                };
                let extras = CellularExtras {
                    rx_bytes: counters.map(|(rx, _)| rx),
                    tx_bytes: counters.map(|(_, tx)| tx),
                    ..CellularExtras::default()
                };
                Sample {
                    member: member.name.clone(),
                    at_mono: ctx.clock.mono(),
                    at_wall: ctx.clock.wall(),
                    latency_ms: stats.latency_ms,
                    loss_pct: stats.loss_pct,
                    jitter_ms: stats.jitter_ms,
                    signal_dbm: None,
                    extras: ClassExtras::Cellular(extras),
                    method,
                    error: Some(format!("no modem service: {}", signal_errors.join("; "))),
                    collected_in_ms: ctx.clock.mono().since(started).as_millis() as u64,
                }
            }
            (Some((signal, _)), Err(ping_error)) => {
                // Signal but no reachability data: degraded with zeroed
                // probe fields so scoring leans on the signal penalties.
                let extras = CellularExtras {
                    rsrp_dbm: signal.rsrp_dbm,
                    rsrq_db: signal.rsrq_db,
                    sinr_db: signal.sinr_db,
                    technology: signal.technology,
                    operator: signal.operator,
                    roaming: signal.roaming,
                    rx_bytes: counters.map(|(rx, _)| rx),
                    tx_bytes: counters.map(|(_, tx)| tx),
                };
                Sample {
                    member: member.name.clone(),
                    at_mono: ctx.clock.mono(),
                    at_wall: ctx.clock.wall(),
                    latency_ms: 0.0,
                    loss_pct: 100.0,
                    jitter_ms: 0.0,
                    signal_dbm: extras.rsrp_dbm,
                    extras: ClassExtras::Cellular(extras),
                    method: CollectionMethod::Degraded,
                    error: Some(format!("ping burst failed: {ping_error}")),
                    collected_in_ms: ctx.clock.mono().since(started).as_millis() as u64,
                }
            }
            (None, Err(ping_error)) => {
                ping_fallback(
                    member,
                    ctx,
                    &self.pinger,
                    format!(
                        "no modem service ({}) and ping failed: {ping_error}",
                        signal_errors.join("; ")
                    ),
                    started,
                )
                .await
            }
        }
    }
}
