//! Interface-bound ping bursts
//!
//! The universal fallback: every class degrades to a ping burst against its
//! configured anchors, and LAN members use nothing else. Probes run through
//! the system `ping` binary bound to the member's interface so the probe
//! actually exercises that uplink.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain_types::InterfaceName;
use crate::platform::CommandRunner;

use super::CollectorError;

/// Merged statistics of one burst.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    /// Mean round-trip latency, milliseconds.
    pub latency_ms: f64,
    /// Loss percentage across all probes, 0..100.
    pub loss_pct: f64,
    /// Mean deviation of the round-trip time, milliseconds.
    pub jitter_ms: f64,
    /// Probes sent.
    pub sent: u32,
    /// Probes answered.
    pub received: u32,
}

/// Ping capability, mockable for tests.
#[async_trait]
pub trait Pinger: Send + Sync + std::fmt::Debug {
    /// Sends `packets_per_host` probes to each host, bound to `interface`,
    /// and merges the results.
    ///
    /// # Errors
    ///
    /// `Unavailable` when every host failed to produce statistics.
    async fn burst(
        &self,
        interface: &InterfaceName,
        hosts: &[String],
        packets_per_host: u32,
        deadline: Duration,
    ) -> Result<PingStats, CollectorError>;
}

/// Pinger backed by the system `ping` binary.
#[derive(Debug)]
pub struct SystemPinger<R: CommandRunner + ?Sized> {
    runner: Arc<R>,
}

impl<R: CommandRunner + ?Sized> SystemPinger<R> {
    /// Wraps a command runner.
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: CommandRunner + ?Sized> Pinger for SystemPinger<R> {
    async fn burst(
        &self,
        interface: &InterfaceName,
        hosts: &[String],
        packets_per_host: u32,
        deadline: Duration,
    ) -> Result<PingStats, CollectorError> {
        if hosts.is_empty() {
            return Err(CollectorError::Unavailable("no ping anchors configured".to_string()));
        }

        let count = packets_per_host.to_string();
        let probes = hosts.iter().map(|host| {
            let count = count.clone();
            async move {
                let result = self
                    .runner
                    .run(
                        "ping",
                        &["-I", interface.as_str(), "-c", &count, "-W", "1", "-q", host],
                        deadline,
                    )
                    .await;
                match result {
                    Ok(output) => parse_ping_summary(&output.stdout),
                    Err(e) => {
                        debug!(host = %host, error = %e, "ping probe failed");
                        None
                    }
                }
            }
        });

        let summaries: Vec<HostSummary> = join_all(probes).await.into_iter().flatten().collect();
        merge_summaries(&summaries).ok_or_else(|| {
            CollectorError::Unavailable(format!("all {} ping anchors failed", hosts.len()))
        })
    }
}

/// Parsed summary of one host's probe.
#[derive(Debug, Clone, Copy)]
struct HostSummary {
    sent: u32,
    received: u32,
    avg_ms: Option<f64>,
    mdev_ms: Option<f64>,
}

/// Parses iputils `ping -q` summary output.
fn parse_ping_summary(output: &str) -> Option<HostSummary> {
    let mut sent = None;
    let mut received = None;
    let mut avg_ms = None;
    let mut mdev_ms = None;

    for line in output.lines() {
        if line.contains("packets transmitted") {
            // "5 packets transmitted, 4 received, 20% packet loss, time 4005ms"
            let mut parts = line.split(',');
            sent = parts
                .next()
                .and_then(|p| p.trim().split(' ').next())
                .and_then(|v| v.parse().ok());
            received = parts
                .next()
                .and_then(|p| p.trim().split(' ').next())
                .and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("rtt min/avg/max/mdev = ") {
            // "rtt min/avg/max/mdev = 38.1/45.2/58.9/7.3 ms"
            let values = rest.trim_end_matches(" ms");
            let mut fields = values.split('/');
            let _min = fields.next();
            avg_ms = fields.next().and_then(|v| v.parse().ok());
            let _max = fields.next();
            mdev_ms = fields.next().and_then(|v| v.parse().ok());
        }
    }

    Some(HostSummary {
        sent: sent?,
        received: received?,
        avg_ms,
        mdev_ms,
    })
}

/// Merges per-host summaries into one burst result. `None` when no host
/// produced a summary.
fn merge_summaries(summaries: &[HostSummary]) -> Option<PingStats> {
    if summaries.is_empty() {
        return None;
    }
    let sent: u32 = summaries.iter().map(|s| s.sent).sum();
    let received: u32 = summaries.iter().map(|s| s.received).sum();
    if sent == 0 {
        return None;
    }

    let answered: Vec<&HostSummary> = summaries
        .iter()
        .filter(|s| s.received > 0 && s.avg_ms.is_some())
        .collect();
    let latency_ms = if answered.is_empty() {
        0.0
    } else {
        let weighted: f64 = answered
            .iter()
            .map(|s| s.avg_ms.unwrap_or(0.0) * f64::from(s.received))
            .sum();
        let total: f64 = answered.iter().map(|s| f64::from(s.received)).sum();
        weighted / total
    };
    let jitter_ms = if answered.is_empty() {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let n = answered.len() as f64;
        answered.iter().filter_map(|s| s.mdev_ms).sum::<f64>() / n
    };
    let loss_pct = f64::from(sent - received) / f64::from(sent) * 100.0;

    Some(PingStats {
        latency_ms,
        loss_pct,
        jitter_ms,
        sent,
        received,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING_OUTPUT: &str = "\
PING 1.1.1.1 (1.1.1.1) from 100.64.0.2 wan: 56(84) bytes of data.

--- 1.1.1.1 ping statistics ---
5 packets transmitted, 4 received, 20% packet loss, time 4005ms
rtt min/avg/max/mdev = 38.100/45.200/58.900/7.300 ms
";

    #[test]
    fn test_parse_ping_summary() {
        let summary = parse_ping_summary(PING_OUTPUT).unwrap();
        assert_eq!(summary.sent, 5);
        assert_eq!(summary.received, 4);
        assert!((summary.avg_ms.unwrap() - 45.2).abs() < 1e-6);
        assert!((summary.mdev_ms.unwrap() - 7.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_total_loss_has_no_rtt_line() {
        let output = "\
--- 8.8.8.8 ping statistics ---
5 packets transmitted, 0 received, 100% packet loss, time 4100ms
";
        let summary = parse_ping_summary(output).unwrap();
        assert_eq!(summary.sent, 5);
        assert_eq!(summary.received, 0);
        assert!(summary.avg_ms.is_none());
    }

    #[test]
    fn test_merge_weights_latency_by_answers() {
        let summaries = vec![
            HostSummary { sent: 5, received: 5, avg_ms: Some(40.0), mdev_ms: Some(2.0) },
            HostSummary { sent: 5, received: 0, avg_ms: None, mdev_ms: None },
            HostSummary { sent: 5, received: 5, avg_ms: Some(60.0), mdev_ms: Some(4.0) },
        ];
        let stats = merge_summaries(&summaries).unwrap();
        assert_eq!(stats.sent, 15);
        assert_eq!(stats.received, 10);
        assert!((stats.latency_ms - 50.0).abs() < 1e-9);
        assert!((stats.loss_pct - 33.333).abs() < 0.01);
        assert!((stats.jitter_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_empty_is_none() {
        assert!(merge_summaries(&[]).is_none());
    }
}
