//! LAN collector: ping-only by definition
//!
//! Wired uplinks have no class API; quality is whatever the anchors answer.

use async_trait::async_trait;
use std::sync::Arc;

use crate::member::{CollectionMethod, Member, MemberClass, Sample};

use super::ping::Pinger;
use super::{CollectContext, PING_BURST_PACKETS, sample_from_ping};

/// Collector for LAN members.
#[derive(Debug)]
pub struct LanCollector {
    pinger: Arc<dyn Pinger>,
}

impl LanCollector {
    /// Creates the collector.
    pub fn new(pinger: Arc<dyn Pinger>) -> Self {
        Self { pinger }
    }
}

#[async_trait]
impl super::Collect for LanCollector {
    fn class(&self) -> MemberClass {
        MemberClass::Lan
    }

    async fn collect(&self, member: &Member, ctx: &CollectContext<'_>) -> Sample {
        let started = ctx.clock.mono();
        let anchors = ctx.anchors(&member.name);
        match self
            .pinger
            .burst(&member.interface, &anchors, PING_BURST_PACKETS, ctx.deadline)
            .await
        {
            Ok(stats) => sample_from_ping(
                &member.name,
                &stats,
                CollectionMethod::Primary,
                None,
                started,
                ctx,
            ),
            Err(e) => Sample::sentinel(
                member.name.clone(),
                ctx.clock.mono(),
                ctx.clock.wall(),
                format!("ping burst failed: {e}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::CollectorError;
    use super::super::ping::PingStats;
    use super::*;
    use crate::collector::Collect;
    use crate::config::{Config, RawConfig};
    use crate::domain_types::{InterfaceName, MemberName};
    use crate::member::MemberState;
    use crate::time_provider::MockTimeProvider;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct MockPinger {
        works: bool,
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
            if self.works {
                Ok(PingStats {
                    latency_ms: 4.0,
                    loss_pct: 0.0,
                    jitter_ms: 0.3,
                    sent: 15,
                    received: 15,
                })
            } else {
                Err(CollectorError::Unavailable("cable unplugged".to_string()))
            }
        }
    }

    fn member() -> Member {
        Member {
            name: MemberName::try_new("lan_wan".to_string()).unwrap(),
            class: MemberClass::Lan,
            interface: InterfaceName::try_new("eth1".to_string()).unwrap(),
            sim_slot: None,
            dish_endpoint: None,
            state: MemberState::Candidate,
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

    async fn run_collect(works: bool) -> Sample {
        let config = Config::from_raw(&RawConfig::default()).unwrap();
        let clock: crate::time_provider::SharedTimeProvider = Arc::new(MockTimeProvider::new());
        let collector = LanCollector::new(Arc::new(MockPinger { works }));
        let ctx = CollectContext {
            config: &config,
            clock: &clock,
            cancel: CancellationToken::new(),
            deadline: Duration::from_secs(2),
        };
        collector.collect(&member(), &ctx).await
    }

    #[tokio::test]
    async fn test_ping_success_is_primary_method() {
        let sample = run_collect(true).await;
        assert_eq!(sample.method, CollectionMethod::Primary);
        assert!((sample.latency_ms - 4.0).abs() < 1e-9);
        assert!(sample.error.is_none());
    }

    #[tokio::test]
    async fn test_ping_failure_is_sentinel() {
        let sample = run_collect(false).await;
        assert!(sample.is_sentinel());
        assert!(sample.error.as_deref().unwrap_or("").contains("cable unplugged"));
    }
}
