//! Bounded in-RAM telemetry store with downsampling
//!
//! Per member: a high-resolution ring of recent Samples plus a ring of
//! 5-minute aggregate buckets. A process-wide RAM ceiling is enforced by
//! collapsing the oldest hi-res samples into buckets first and dropping the
//! oldest buckets second. Appends never block on shedding decisions longer
//! than a short per-member critical section.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use crate::domain_types::MemberName;
use crate::member::{Decision, Sample};
use crate::time_provider::MonoTime;

/// Estimated retained cost of one hi-res sample, including heap payload.
const SAMPLE_COST_BYTES: usize = std::mem::size_of::<Sample>() + 96;
/// Retained cost of one aggregate bucket.
const BUCKET_COST_BYTES: usize = std::mem::size_of::<Bucket>();
/// Retained cost of one decision audit record.
const DECISION_COST_BYTES: usize = 512;
/// Decision audit ring capacity.
const DECISION_CAP: usize = 256;

/// One downsampled aggregate over a bucket interval.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Bucket {
    /// Monotonic start of the bucket interval.
    pub start_mono: MonoTime,
    /// Samples folded into this bucket.
    pub count: u32,
    /// Mean latency over the bucket, milliseconds.
    pub latency_avg_ms: f64,
    /// Worst latency over the bucket, milliseconds.
    pub latency_max_ms: f64,
    /// Mean loss over the bucket, percent.
    pub loss_avg_pct: f64,
    /// Mean jitter over the bucket, milliseconds.
    pub jitter_avg_ms: f64,
    /// Samples that carried a collection error.
    pub error_count: u32,
}

/// Accumulator for the bucket currently being filled.
#[derive(Debug, Clone, Copy)]
struct BucketAccum {
    start_mono: MonoTime,
    count: u32,
    latency_sum: f64,
    latency_max: f64,
    loss_sum: f64,
    jitter_sum: f64,
    error_count: u32,
}

impl BucketAccum {
    fn new(start_mono: MonoTime) -> Self {
        Self {
            start_mono,
            count: 0,
            latency_sum: 0.0,
            latency_max: 0.0,
            loss_sum: 0.0,
            jitter_sum: 0.0,
            error_count: 0,
        }
    }

    fn fold(&mut self, sample: &Sample) {
        self.count += 1;
        self.latency_sum += sample.latency_ms;
        self.latency_max = self.latency_max.max(sample.latency_ms);
        self.loss_sum += sample.loss_pct;
        self.jitter_sum += sample.jitter_ms;
        if sample.error.is_some() {
            self.error_count += 1;
        }
    }

    fn finish(self) -> Bucket {
        let n = f64::from(self.count.max(1));
        Bucket {
            start_mono: self.start_mono,
            count: self.count,
            latency_avg_ms: self.latency_sum / n,
            latency_max_ms: self.latency_max,
            loss_avg_pct: self.loss_sum / n,
            jitter_avg_ms: self.jitter_sum / n,
            error_count: self.error_count,
        }
    }
}

#[derive(Debug)]
struct MemberSeries {
    hi: VecDeque<Sample>,
    buckets: VecDeque<Bucket>,
    pending: Option<BucketAccum>,
}

impl MemberSeries {
    fn new() -> Self {
        Self {
            hi: VecDeque::new(),
            buckets: VecDeque::new(),
            pending: None,
        }
    }

    fn cost(&self) -> usize {
        self.hi.len() * SAMPLE_COST_BYTES
            + self.buckets.len() * BUCKET_COST_BYTES
            + usize::from(self.pending.is_some()) * BUCKET_COST_BYTES
    }

    /// Removes the oldest hi-res sample and folds it into the bucket ring.
    /// Returns false when the hi ring is empty.
    fn collapse_oldest(&mut self, limits: &StoreLimits) -> bool {
        let Some(sample) = self.hi.pop_front() else {
            return false;
        };
        let bucket_millis = u64::try_from(limits.bucket_len.as_millis()).unwrap_or(u64::MAX).max(1);
        let bucket_start =
            MonoTime::from_millis((sample.at_mono.as_millis() / bucket_millis) * bucket_millis);

        match self.pending {
            Some(ref mut accum) if accum.start_mono == bucket_start => accum.fold(&sample),
            Some(accum) => {
                self.push_bucket(accum.finish(), limits);
                let mut next = BucketAccum::new(bucket_start);
                next.fold(&sample);
                self.pending = Some(next);
            }
            None => {
                let mut accum = BucketAccum::new(bucket_start);
                accum.fold(&sample);
                self.pending = Some(accum);
            }
        }
        true
    }

    fn push_bucket(&mut self, bucket: Bucket, limits: &StoreLimits) {
        if self.buckets.len() >= limits.bucket_cap {
            self.buckets.pop_front();
        }
        self.buckets.push_back(bucket);
    }

    fn drop_oldest_bucket(&mut self) -> bool {
        self.buckets.pop_front().is_some()
    }
}

/// Capacity knobs derived from configuration.
#[derive(Debug, Clone)]
pub struct StoreLimits {
    /// Per-member hi-res ring capacity.
    pub hi_cap: usize,
    /// Per-member bucket ring capacity.
    pub bucket_cap: usize,
    /// Bucket interval.
    pub bucket_len: Duration,
    /// Process-wide RAM ceiling in bytes.
    pub max_ram_bytes: usize,
}

impl StoreLimits {
    /// Derives limits so the hi ring spans at least `retention` at the given
    /// poll interval and the bucket ring covers at least 24 hours.
    #[must_use]
    pub fn derive(poll_interval: Duration, retention: Duration, bucket_len: Duration, max_ram_bytes: usize) -> Self {
        let poll_millis = poll_interval.as_millis().max(1);
        let hi_cap = usize::try_from(retention.as_millis().div_ceil(poll_millis)).unwrap_or(usize::MAX);
        let bucket_millis = bucket_len.as_millis().max(1);
        let day_millis = Duration::from_secs(24 * 3600).as_millis();
        let bucket_cap = usize::try_from(day_millis.div_ceil(bucket_millis)).unwrap_or(usize::MAX);
        Self {
            hi_cap: hi_cap.max(1),
            bucket_cap: bucket_cap.max(1),
            bucket_len,
            max_ram_bytes,
        }
    }
}

/// Process-wide telemetry store.
#[derive(Debug)]
pub struct TelemetryStore {
    series: DashMap<MemberName, Mutex<MemberSeries>>,
    decisions: Mutex<VecDeque<Decision>>,
    limits: Mutex<StoreLimits>,
    ram: AtomicUsize,
}

impl TelemetryStore {
    /// Creates a store with the given limits.
    #[must_use]
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            series: DashMap::new(),
            decisions: Mutex::new(VecDeque::new()),
            limits: Mutex::new(limits),
            ram: AtomicUsize::new(0),
        }
    }

    /// Swaps in new limits on config reload. Existing data is shed lazily on
    /// the next append.
    pub fn reconfigure(&self, limits: StoreLimits) {
        *self.limits.lock() = limits;
    }

    /// Appends one sample for a member, trimming and shedding as needed.
    pub fn append(&self, sample: Sample) {
        let limits = self.limits.lock().clone();
        let member = sample.member.clone();
        let entry = self
            .series
            .entry(member)
            .or_insert_with(|| Mutex::new(MemberSeries::new()));

        {
            let mut series = entry.lock();
            let before = series.cost();
            series.hi.push_back(sample);
            while series.hi.len() > limits.hi_cap {
                series.collapse_oldest(&limits);
            }
            let after = series.cost();
            self.adjust_ram(before, after);
        }
        drop(entry);

        if self.ram.load(Ordering::Relaxed) > limits.max_ram_bytes {
            self.shed(&limits);
        }
    }

    /// Collapse-then-drop shedding until RAM fits the ceiling again.
    fn shed(&self, limits: &StoreLimits) {
        // Pass 1: collapse hi-res samples into buckets, oldest first.
        loop {
            if self.ram.load(Ordering::Relaxed) <= limits.max_ram_bytes {
                return;
            }
            let mut progressed = false;
            for entry in &self.series {
                let mut series = entry.value().lock();
                let before = series.cost();
                if series.collapse_oldest(limits) {
                    progressed = true;
                }
                let after = series.cost();
                self.adjust_ram(before, after);
                if self.ram.load(Ordering::Relaxed) <= limits.max_ram_bytes {
                    return;
                }
            }
            if !progressed {
                break;
            }
        }

        // Pass 2: drop the oldest buckets.
        loop {
            if self.ram.load(Ordering::Relaxed) <= limits.max_ram_bytes {
                return;
            }
            let mut progressed = false;
            for entry in &self.series {
                let mut series = entry.value().lock();
                let before = series.cost();
                if series.drop_oldest_bucket() {
                    progressed = true;
                }
                let after = series.cost();
                self.adjust_ram(before, after);
                if self.ram.load(Ordering::Relaxed) <= limits.max_ram_bytes {
                    return;
                }
            }
            if !progressed {
                debug!("telemetry shed exhausted all data while over budget");
                return;
            }
        }
    }

    fn adjust_ram(&self, before: usize, after: usize) {
        if after >= before {
            self.ram.fetch_add(after - before, Ordering::Relaxed);
        } else {
            self.ram.fetch_sub(before - after, Ordering::Relaxed);
        }
    }

    /// Consistent snapshot of a member's samples newer than `now - window`.
    #[must_use]
    pub fn window(&self, member: &MemberName, window: Duration, now: MonoTime) -> Vec<Sample> {
        let Some(entry) = self.series.get(member) else {
            return Vec::new();
        };
        let series = entry.lock();
        let cutoff = now.since(MonoTime::ZERO).saturating_sub(window);
        let cutoff = MonoTime::ZERO + cutoff;
        series
            .hi
            .iter()
            .filter(|s| s.at_mono >= cutoff)
            .cloned()
            .collect()
    }

    /// The freshest sample for a member, if any.
    #[must_use]
    pub fn latest(&self, member: &MemberName) -> Option<Sample> {
        self.series
            .get(member)
            .and_then(|entry| entry.lock().hi.back().cloned())
    }

    /// Snapshot of a member's aggregate buckets, oldest first.
    #[must_use]
    pub fn aggregate(&self, member: &MemberName) -> Vec<Bucket> {
        let Some(entry) = self.series.get(member) else {
            return Vec::new();
        };
        let series = entry.lock();
        let mut buckets: Vec<Bucket> = series.buckets.iter().copied().collect();
        if let Some(pending) = series.pending {
            buckets.push(pending.finish());
        }
        buckets
    }

    /// Appends a decision audit record.
    pub fn record_decision(&self, decision: Decision) {
        let mut decisions = self.decisions.lock();
        let before = decisions.len() * DECISION_COST_BYTES;
        if decisions.len() >= DECISION_CAP {
            decisions.pop_front();
        }
        decisions.push_back(decision);
        let after = decisions.len() * DECISION_COST_BYTES;
        drop(decisions);
        self.adjust_ram(before, after);
        trace!("decision recorded");
    }

    /// The most recent decisions, newest first, at most `limit`.
    #[must_use]
    pub fn events(&self, limit: usize) -> Vec<Decision> {
        let decisions = self.decisions.lock();
        decisions.iter().rev().take(limit).cloned().collect()
    }

    /// Current accounted RAM usage in bytes.
    #[must_use]
    pub fn ram_bytes(&self) -> usize {
        self.ram.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{ClassExtras, CollectionMethod};

    fn name(s: &str) -> MemberName {
        MemberName::try_new(s.to_string()).unwrap()
    }

    fn sample(member: &MemberName, at_ms: u64, latency: f64) -> Sample {
        Sample {
            member: member.clone(),
            at_mono: MonoTime::from_millis(at_ms),
            at_wall: chrono::Utc::now(),
            latency_ms: latency,
            loss_pct: 0.5,
            jitter_ms: 2.0,
            signal_dbm: None,
            extras: ClassExtras::None,
            method: CollectionMethod::Primary,
            error: None,
            collected_in_ms: 10,
        }
    }

    fn small_limits(hi_cap: usize, max_ram_bytes: usize) -> StoreLimits {
        StoreLimits {
            hi_cap,
            bucket_cap: 288,
            bucket_len: Duration::from_secs(300),
            max_ram_bytes,
        }
    }

    #[test]
    fn test_hi_ring_trims_to_capacity() {
        let store = TelemetryStore::new(small_limits(5, usize::MAX));
        let m = name("starlink_any");
        for i in 0..20 {
            store.append(sample(&m, i * 1000, 30.0));
        }
        let window = store.window(&m, Duration::from_secs(3600), MonoTime::from_millis(20_000));
        assert_eq!(window.len(), 5, "hi ring holds at most hi_cap samples");
        // Overflow went into buckets, not the void.
        let buckets = store.aggregate(&m);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u32>(), 15);
    }

    #[test]
    fn test_window_filters_by_age() {
        let store = TelemetryStore::new(small_limits(100, usize::MAX));
        let m = name("lan_wan");
        for i in 0..10 {
            store.append(sample(&m, i * 1000, 10.0));
        }
        let recent = store.window(&m, Duration::from_secs(3), MonoTime::from_millis(9000));
        assert_eq!(recent.len(), 4, "samples at 6,7,8,9 seconds");
    }

    #[test]
    fn test_ram_cap_sheds_into_buckets_first() {
        let cap = 40 * SAMPLE_COST_BYTES;
        let store = TelemetryStore::new(small_limits(10_000, cap));
        let m = name("cellular_sim1");
        for i in 0..500 {
            store.append(sample(&m, i * 1000, 50.0));
        }
        assert!(
            store.ram_bytes() <= cap,
            "ram {} exceeds cap {}",
            store.ram_bytes(),
            cap
        );
        let buckets = store.aggregate(&m);
        assert!(!buckets.is_empty(), "shedding must collapse into buckets");
        let folded: u32 = buckets.iter().map(|b| b.count).sum();
        let kept = store
            .window(&m, Duration::from_secs(100_000), MonoTime::from_millis(500_000))
            .len();
        assert_eq!(folded as usize + kept, 500, "no sample silently dropped");
    }

    #[test]
    fn test_bucket_aggregation_averages() {
        let limits = StoreLimits {
            hi_cap: 1,
            bucket_cap: 10,
            bucket_len: Duration::from_secs(300),
            max_ram_bytes: usize::MAX,
        };
        let store = TelemetryStore::new(limits);
        let m = name("wifi_sta");
        // hi_cap of 1 pushes every older sample straight into the accumulator.
        store.append(sample(&m, 0, 10.0));
        store.append(sample(&m, 1000, 30.0));
        store.append(sample(&m, 2000, 50.0));

        let buckets = store.aggregate(&m);
        let total: u32 = buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 2);
        let avg = buckets
            .iter()
            .map(|b| b.latency_avg_ms * f64::from(b.count))
            .sum::<f64>()
            / f64::from(total);
        assert!((avg - 20.0).abs() < 1e-9, "folded samples were 10 and 30");
    }

    #[test]
    fn test_decision_ring_caps() {
        let store = TelemetryStore::new(small_limits(10, usize::MAX));
        for _ in 0..(DECISION_CAP + 10) {
            store.record_decision(crate::member::Decision {
                id: uuid::Uuid::new_v4(),
                at_wall: chrono::Utc::now(),
                at_mono: MonoTime::ZERO,
                from_member: None,
                to_member: name("lan_wan"),
                reason: crate::member::DecisionReason::new(
                    crate::member::ReasonKind::InitialSelection,
                    "test",
                ),
                trigger: crate::member::DecisionTrigger::Discovery,
                scores: std::collections::BTreeMap::new(),
                successful: true,
                error: None,
                duration_ms: 1,
                dry_run: false,
            });
        }
        assert_eq!(store.events(usize::MAX).len(), DECISION_CAP);
        assert_eq!(store.events(5).len(), 5);
    }

    #[test]
    fn test_latest_returns_newest() {
        let store = TelemetryStore::new(small_limits(10, usize::MAX));
        let m = name("starlink_any");
        store.append(sample(&m, 0, 10.0));
        store.append(sample(&m, 1000, 99.0));
        let latest = store.latest(&m).unwrap();
        assert!((latest.latency_ms - 99.0).abs() < f64::EPSILON);
    }
}
