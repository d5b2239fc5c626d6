//! Starlink collector
//!
//! Primary path: dish gRPC (`get_status` + `get_diagnostics`, with
//! `get_history` for jitter and `get_device_info` cached once). Degraded
//! path: interface-bound ping burst. Obstruction classification itself lives
//! in scoring; the collector reports the raw fields.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::member::{
    ClassExtras, CollectionMethod, Member, MemberClass, Sample, StarlinkExtras,
};
use crate::retry::{RetryPolicy, run_with_retry};

use super::dish::{DishHistory, DishRpc, DishStatus};
use super::ping::Pinger;
use super::{CollectContext, CollectorError, ping_fallback};

/// Collector for Starlink members.
#[derive(Debug)]
pub struct StarlinkCollector {
    dish: Arc<dyn DishRpc>,
    pinger: Arc<dyn Pinger>,
    device_info: OnceCell<()>,
}

impl StarlinkCollector {
    /// Creates the collector over a dish client and the shared pinger.
    pub fn new(dish: Arc<dyn DishRpc>, pinger: Arc<dyn Pinger>) -> Self {
        Self {
            dish,
            pinger,
            device_info: OnceCell::new(),
        }
    }

    /// Mean-deviation jitter from the recent latency series.
    fn jitter_from_history(history: &DishHistory) -> f64 {
        let series = &history.pop_ping_latency_ms;
        if series.len() < 2 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = series.len() as f64;
        let mean = series.iter().sum::<f64>() / n;
        series.iter().map(|v| (v - mean).abs()).sum::<f64>() / n
    }

    async fn primary_path(
        &self,
        ctx: &CollectContext<'_>,
        rpc_deadline: Duration,
    ) -> Result<(DishStatus, Option<DishHistory>, Option<String>), CollectorError> {
        let policy = RetryPolicy::short(rpc_deadline);
        let status = run_with_retry(
            &policy,
            ctx.clock,
            &ctx.cancel,
            || self.dish.get_status(rpc_deadline),
            |e| !matches!(e, CollectorError::Cancelled),
        )
        .await
        .map_err(CollectorError::from)?;

        // Identify the dish once; purely informational.
        let _ = self
            .device_info
            .get_or_try_init(|| async {
                let info = self.dish.get_device_info(rpc_deadline).await?;
                info!(
                    id = %info.id,
                    hardware = %info.hardware_version,
                    software = %info.software_version,
                    "starlink dish identified"
                );
                Ok::<(), CollectorError>(())
            })
            .await;

        // Diagnostics enrich obstruction data; their failure only degrades
        // the sample.
        let mut degradation = None;
        let mut status = status;
        if status.obstruction.is_none() {
            match self.dish.get_diagnostics(rpc_deadline).await {
                Ok(obstruction) => status.obstruction = Some(obstruction),
                Err(e) => {
                    debug!(error = %e, "dish diagnostics unavailable");
                    degradation = Some(format!("diagnostics unavailable: {e}"));
                }
            }
        }

        let history = match self.dish.get_history(rpc_deadline).await {
            Ok(history) => Some(history),
            Err(e) => {
                debug!(error = %e, "dish history unavailable");
                degradation.get_or_insert_with(|| format!("history unavailable: {e}"));
                None
            }
        };

        if ctx.config.starlink.poll_location {
            if let Ok(location) = self.dish.get_location(rpc_deadline).await {
                debug!(lat = location.lat, lon = location.lon, "dish location");
            }
        }

        Ok((status, history, degradation))
    }
}

#[async_trait]
impl super::Collect for StarlinkCollector {
    fn class(&self) -> MemberClass {
        MemberClass::Starlink
    }

    async fn collect(&self, member: &Member, ctx: &CollectContext<'_>) -> Sample {
        let started = ctx.clock.mono();
        let rpc_deadline = ctx.config.starlink.rpc_timeout.min(ctx.deadline);

        match self.primary_path(ctx, rpc_deadline).await {
            Ok((status, history, degradation)) => {
                let jitter = history
                    .as_ref()
                    .map(|h| Self::jitter_from_history(h))
                    .unwrap_or(0.0);
                let obstruction = status.obstruction;
                let extras = StarlinkExtras {
                    snr: status.snr,
                    snr_above_noise_floor: status.snr_above_noise_floor,
                    snr_persistently_low: status.snr_persistently_low,
                    fraction_obstructed: obstruction.map(|o| o.fraction_obstructed),
                    time_obstructed: obstruction.map(|o| o.time_obstructed),
                    avg_prolonged_obstruction_s: obstruction.map(|o| o.avg_prolonged_obstruction_s),
                    valid_s: obstruction.map(|o| o.valid_s),
                    patches_valid: obstruction.map(|o| o.patches_valid),
                    uptime_s: status.uptime_s,
                    alerts: status.alerts,
                };
                let method = if degradation.is_some() {
                    CollectionMethod::Degraded
                } else {
                    CollectionMethod::Primary
                };
                Sample {
                    member: member.name.clone(),
                    at_mono: ctx.clock.mono(),
                    at_wall: ctx.clock.wall(),
                    latency_ms: status.pop_ping_latency_ms.unwrap_or(0.0),
                    loss_pct: status.pop_ping_drop_rate.unwrap_or(0.0) * 100.0,
                    jitter_ms: jitter,
                    signal_dbm: None,
                    extras: ClassExtras::Starlink(extras),
                    method,
                    error: degradation,
                    collected_in_ms: ctx.clock.mono().since(started).as_millis() as u64,
                }
            }
            Err(e) => {
                debug!(member = %member.name, error = %e, "dish unreachable, falling back to ping");
                ping_fallback(member, ctx, &self.pinger, format!("dish rpc failed: {e}"), started)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::dish::{DishDeviceInfo, DishLocation, DishObstruction};
    use super::super::ping::PingStats;
    use super::*;
    use crate::collector::Collect;
    use crate::config::{Config, RawConfig};
    use crate::domain_types::{InterfaceName, MemberName};
    use crate::member::{DishAlerts, MemberState};
    use crate::time_provider::MockTimeProvider;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Default)]
    struct MockDish {
        status: Mutex<Option<DishStatus>>,
        fail_status: bool,
        fail_diagnostics: bool,
    }

    #[async_trait]
    impl DishRpc for MockDish {
        async fn get_status(&self, _deadline: Duration) -> Result<DishStatus, CollectorError> {
            if self.fail_status {
                return Err(CollectorError::Unavailable("dish offline".to_string()));
            }
            Ok(self.status.lock().clone().unwrap_or_default())
        }

        async fn get_diagnostics(
            &self,
            _deadline: Duration,
        ) -> Result<DishObstruction, CollectorError> {
            if self.fail_diagnostics {
                return Err(CollectorError::Unavailable("diagnostics offline".to_string()));
            }
            Ok(DishObstruction {
                fraction_obstructed: 0.01,
                ..DishObstruction::default()
            })
        }

        async fn get_history(&self, _deadline: Duration) -> Result<DishHistory, CollectorError> {
            Ok(DishHistory {
                pop_ping_latency_ms: vec![40.0, 42.0, 44.0, 38.0],
                pop_ping_drop_rate: vec![0.0, 0.01, 0.0, 0.0],
            })
        }

        async fn get_device_info(
            &self,
            _deadline: Duration,
        ) -> Result<DishDeviceInfo, CollectorError> {
            Ok(DishDeviceInfo::default())
        }

        async fn get_location(&self, _deadline: Duration) -> Result<DishLocation, CollectorError> {
            Ok(DishLocation::default())
        }
    }

    #[derive(Debug, Default)]
    struct MockPinger {
        fail: bool,
    }

    #[async_trait]
    impl Pinger for MockPinger {
        async fn burst(
            &self,
            _interface: &InterfaceName,
            _hosts: &[String],
            _packets: u32,
            _deadline: Duration,
        ) -> Result<PingStats, CollectorError> {
            if self.fail {
                return Err(CollectorError::Unavailable("no route".to_string()));
            }
            Ok(PingStats {
                latency_ms: 55.0,
                loss_pct: 1.0,
                jitter_ms: 3.0,
                sent: 15,
                received: 14,
            })
        }
    }

    fn member() -> Member {
        Member {
            name: MemberName::try_new("starlink_any".to_string()).unwrap(),
            class: MemberClass::Starlink,
            interface: InterfaceName::try_new("wan".to_string()).unwrap(),
            sim_slot: None,
            dish_endpoint: None,
            state: MemberState::Primary,
            eligible: true,
            detected: true,
            enabled: true,
            cooldown_until: None,
            consecutive_errors: 0,
            consecutive_ok: 0,
            last_seen_ok: None,
            metric_good: None,
            metric_bad: None,
        }
    }

    async fn run_collect(dish: MockDish, pinger: MockPinger) -> Sample {
        let config = Config::from_raw(&RawConfig::default()).unwrap();
        let clock: crate::time_provider::SharedTimeProvider = Arc::new(MockTimeProvider::new());
        let collector = StarlinkCollector::new(Arc::new(dish), Arc::new(pinger));
        let ctx = CollectContext {
            config: &config,
            clock: &clock,
            cancel: CancellationToken::new(),
            deadline: Duration::from_secs(2),
        };
        collector.collect(&member(), &ctx).await
    }

    #[tokio::test]
    async fn test_primary_path_builds_starlink_sample() {
        let dish = MockDish::default();
        *dish.status.lock() = Some(DishStatus {
            pop_ping_latency_ms: Some(38.5),
            pop_ping_drop_rate: Some(0.02),
            snr: Some(9.0),
            snr_above_noise_floor: Some(true),
            snr_persistently_low: Some(false),
            uptime_s: Some(3600),
            obstruction: Some(DishObstruction {
                fraction_obstructed: 0.003,
                time_obstructed: 0.0001,
                avg_prolonged_obstruction_s: 0.0,
                valid_s: 70_000.0,
                patches_valid: 9000,
            }),
            alerts: DishAlerts::default(),
        });
        let sample = run_collect(dish, MockPinger::default()).await;

        assert_eq!(sample.method, CollectionMethod::Primary);
        assert!(sample.error.is_none());
        assert!((sample.latency_ms - 38.5).abs() < 1e-9);
        assert!((sample.loss_pct - 2.0).abs() < 1e-9);
        assert!(sample.jitter_ms > 0.0, "jitter derived from history");
        let extras = sample.extras.starlink().expect("starlink extras");
        assert_eq!(extras.uptime_s, Some(3600));
        assert_eq!(extras.fraction_obstructed, Some(0.003));
    }

    #[tokio::test]
    async fn test_missing_diagnostics_degrades_sample() {
        let dish = MockDish {
            fail_diagnostics: true,
            ..MockDish::default()
        };
        // Status without embedded obstruction stats forces the diagnostics
        // call.
        *dish.status.lock() = Some(DishStatus {
            pop_ping_latency_ms: Some(40.0),
            pop_ping_drop_rate: Some(0.0),
            ..DishStatus::default()
        });
        let sample = run_collect(dish, MockPinger::default()).await;
        assert_eq!(sample.method, CollectionMethod::Degraded);
        assert!(sample.error.as_deref().unwrap_or("").contains("diagnostics"));
    }

    #[tokio::test]
    async fn test_dish_down_falls_back_to_ping() {
        let dish = MockDish {
            fail_status: true,
            ..MockDish::default()
        };
        let sample = run_collect(dish, MockPinger::default()).await;
        assert_eq!(sample.method, CollectionMethod::PingFallback);
        assert!((sample.latency_ms - 55.0).abs() < 1e-9);
        assert!(sample.error.as_deref().unwrap_or("").contains("dish rpc failed"));
    }

    #[tokio::test]
    async fn test_everything_down_produces_sentinel() {
        let dish = MockDish {
            fail_status: true,
            ..MockDish::default()
        };
        let pinger = MockPinger { fail: true };
        let sample = run_collect(dish, pinger).await;
        assert!(sample.is_sentinel());
        assert!((sample.loss_pct - 100.0).abs() < 1e-9);
    }
}
