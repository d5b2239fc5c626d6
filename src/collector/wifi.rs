//! Wi-Fi collector
//!
//! Wireless status (associated AP signal, link rate, mode) comes from the
//! platform's iwinfo surface; reachability from the ping burst. AP-mode
//! interfaces are reported so the registry can keep them out of the eligible
//! set.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain_types::InterfaceName;
use crate::member::{ClassExtras, CollectionMethod, Member, MemberClass, Sample, WifiExtras};
use crate::platform::{CommandRunner, Ubus};
use crate::retry::{RetryPolicy, run_with_retry};

use super::ping::Pinger;
use super::{CollectContext, CollectorError, PING_BURST_PACKETS, ping_fallback};

/// A wireless link as the platform reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WifiLink {
    /// Signal of the associated AP, dBm.
    pub signal_dbm: Option<f64>,
    /// Negotiated link rate, Mbit/s.
    pub bitrate_mbit: Option<f64>,
    /// Whether the interface runs in station mode.
    pub station_mode: bool,
}

/// Wireless status capability.
#[async_trait]
pub trait WirelessStatus: Send + Sync + std::fmt::Debug {
    /// Queries link state for an interface.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the wireless stack does not know the interface.
    async fn link(&self, interface: &InterfaceName, deadline: Duration)
    -> Result<WifiLink, CollectorError>;
}

/// iwinfo-backed wireless status over ubus.
#[derive(Debug)]
pub struct UbusIwinfo<R: CommandRunner + ?Sized> {
    ubus: Ubus<R>,
}

impl<R: CommandRunner + ?Sized> UbusIwinfo<R> {
    /// Wraps the platform runner.
    pub fn new(runner: Arc<R>) -> Self {
        Self {
            ubus: Ubus::new(runner),
        }
    }
}

#[async_trait]
impl<R: CommandRunner + ?Sized> WirelessStatus for UbusIwinfo<R> {
    async fn link(
        &self,
        interface: &InterfaceName,
        deadline: Duration,
    ) -> Result<WifiLink, CollectorError> {
        let reply = self
            .ubus
            .call("iwinfo", "info", &json!({ "device": interface.as_str() }), deadline)
            .await?;
        if reply.is_null() {
            return Err(CollectorError::Unavailable(format!(
                "iwinfo knows nothing about {interface}"
            )));
        }
        let mode = reply.get("mode").and_then(|v| v.as_str()).unwrap_or("");
        Ok(WifiLink {
            signal_dbm: reply.get("signal").and_then(serde_json::Value::as_f64),
            bitrate_mbit: reply
                .get("bitrate")
                .and_then(serde_json::Value::as_f64)
                // iwinfo reports kbit/s.
                .map(|kbit| kbit / 1000.0),
            station_mode: mode.eq_ignore_ascii_case("client") || mode.eq_ignore_ascii_case("sta"),
        })
    }
}

/// Collector for Wi-Fi station members.
#[derive(Debug)]
pub struct WifiCollector {
    wireless: Arc<dyn WirelessStatus>,
    pinger: Arc<dyn Pinger>,
}

impl WifiCollector {
    /// Creates the collector.
    pub fn new(wireless: Arc<dyn WirelessStatus>, pinger: Arc<dyn Pinger>) -> Self {
        Self { wireless, pinger }
    }
}

#[async_trait]
impl super::Collect for WifiCollector {
    fn class(&self) -> MemberClass {
        MemberClass::Wifi
    }

    async fn collect(&self, member: &Member, ctx: &CollectContext<'_>) -> Sample {
        let started = ctx.clock.mono();
        let link_deadline = ctx.deadline / 2;
        let policy = RetryPolicy::short(link_deadline);
        let link = run_with_retry(
            &policy,
            ctx.clock,
            &ctx.cancel,
            || self.wireless.link(&member.interface, link_deadline),
            |e| !matches!(e, CollectorError::Cancelled),
        )
        .await
        .map_err(CollectorError::from);

        let anchors = ctx.anchors(&member.name);
        let ping = self
            .pinger
            .burst(&member.interface, &anchors, PING_BURST_PACKETS, ctx.deadline)
            .await;

        match (link, ping) {
            (Ok(link), Ok(stats)) => Sample {
                member: member.name.clone(),
                at_mono: ctx.clock.mono(),
                at_wall: ctx.clock.wall(),
                latency_ms: stats.latency_ms,
                loss_pct: stats.loss_pct,
                jitter_ms: stats.jitter_ms,
                signal_dbm: link.signal_dbm,
                extras: ClassExtras::Wifi(WifiExtras {
                    bitrate_mbit: link.bitrate_mbit,
                    station_mode: link.station_mode,
                }),
                method: CollectionMethod::Primary,
                error: None,
                collected_in_ms: ctx.clock.mono().since(started).as_millis() as u64,
            },
            (Err(link_error), Ok(stats)) => {
                debug!(member = %member.name, error = %link_error, "wireless status unavailable");
                let mut sample = super::sample_from_ping(
                    &member.name,
                    &stats,
                    CollectionMethod::PingFallback,
                    Some(format!("wireless status unavailable: {link_error}")),
                    started,
                    ctx,
                );
                // Without iwinfo the interface is assumed to be a station;
                // eligibility is not revoked on a status outage alone.
                sample.extras = ClassExtras::Wifi(WifiExtras {
                    bitrate_mbit: None,
                    station_mode: true,
                });
                sample
            }
            (_, Err(ping_error)) => {
                ping_fallback(
                    member,
                    ctx,
                    &self.pinger,
                    format!("ping burst failed: {ping_error}"),
                    started,
                )
                .await
            }
        }
    }
}
