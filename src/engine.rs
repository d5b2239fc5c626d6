//! Decision engine: scoring, hysteresis, predictive triggers, cooldowns
//!
//! The engine is invoked once per tick with explicit snapshots (config,
//! registry, this tick's samples) and returns at most one Decision. It keeps
//! only its own derived state: per-member EWMA, dwell tracking, predictive
//! state, and the backoff applied after controller failures. Registry
//! mutations happen outside, after the controller reports the outcome.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chrono::{DateTime, Timelike, Utc};

use crate::config::Config;
use crate::domain_types::MemberName;
use crate::member::{
    ClassExtras, Decision, DecisionReason, DecisionTrigger, Member, ReasonKind, Sample, Score,
};
use crate::registry::RegistrySnapshot;
use crate::scoring::{
    self, PredictiveSignal, PredictiveState, ScoreKeeper, assess_obstruction,
};
use crate::telemetry::TelemetryStore;
use crate::time_provider::MonoTime;

/// Near-miss audit: a kept-back switch.
const NEAR_MISS_CAP: usize = 32;
/// Base backoff after a controller failure.
const APPLY_BACKOFF_BASE: Duration = Duration::from_secs(5);
/// Cap on the controller-failure backoff.
const APPLY_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Operator-requested action, delivered through the RPC surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualAction {
    /// Switch away from the current primary to the best other candidate.
    Failover,
    /// Switch to the most preferred-class eligible candidate.
    Restore,
    /// Switch to a specific member.
    Switch(MemberName),
    /// Evaluate this tick as usual (no special handling).
    Recheck,
}

/// A manual action plus its force flag. Manual actions always bypass margin
/// and dwell; `force` additionally bypasses cooldowns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualRequest {
    /// The requested action.
    pub action: ManualAction,
    /// Bypass cooldowns.
    pub force: bool,
}

/// A switch that met the margin but not yet the dwell.
#[derive(Debug, Clone, PartialEq)]
pub struct NearMiss {
    /// When the near-miss was recorded.
    pub at: MonoTime,
    /// Candidate that was ahead.
    pub candidate: MemberName,
    /// Primary it failed to displace.
    pub primary: MemberName,
    /// Observed margin, score points.
    pub margin: f64,
    /// How long the margin had held.
    pub held_for: Duration,
    /// Dwell the margin must hold for.
    pub required: Duration,
}

/// Everything the engine reads during one tick.
pub struct TickInput<'a> {
    /// Monotonic tick time.
    pub now: MonoTime,
    /// Wall-clock tick time.
    pub wall: DateTime<Utc>,
    /// Config snapshot for this tick.
    pub config: &'a Config,
    /// Registry snapshot for this tick.
    pub snapshot: &'a RegistrySnapshot,
    /// Telemetry history.
    pub store: &'a TelemetryStore,
    /// Samples collected this tick, one per collected member.
    pub samples: &'a BTreeMap<MemberName, Sample>,
    /// Manual action to honor this tick, if any.
    pub manual: Option<&'a ManualRequest>,
}

/// Engine output for one tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// The switch to apply, if any. `successful`/`duration_ms` are filled in
    /// by the controller afterwards.
    pub decision: Option<Decision>,
    /// Scores of every member scored this tick.
    pub scores: BTreeMap<MemberName, Score>,
    /// Predictive signals raised for the current primary.
    pub signals: Vec<PredictiveSignal>,
    /// Near-miss recorded this tick, if any.
    pub near_miss: Option<NearMiss>,
}

#[derive(Debug, Default)]
struct MemberTrack {
    keeper: ScoreKeeper,
    predictive: PredictiveState,
    superior_since: Option<MonoTime>,
}

#[derive(Debug, Clone)]
struct ApplyBackoff {
    to: MemberName,
    until: MonoTime,
    attempt: u32,
}

/// The decision engine. One instance, invoked serially by the scheduler.
#[derive(Debug, Default)]
pub struct DecisionEngine {
    tracks: HashMap<MemberName, MemberTrack>,
    last_primary: Option<MemberName>,
    backoff: Option<ApplyBackoff>,
    near_misses: VecDeque<NearMiss>,
}

impl DecisionEngine {
    /// Creates a fresh engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recent near-misses, newest last.
    #[must_use]
    pub fn near_misses(&self) -> Vec<NearMiss> {
        self.near_misses.iter().cloned().collect()
    }

    /// Evaluates one tick. Samples from this tick take precedence over
    /// stored history; members without any sample are scored unusable.
    pub fn evaluate(&mut self, input: &TickInput<'_>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if !input.config.main.enable {
            return outcome;
        }

        let eligible: Vec<&Member> = input.snapshot.eligible().collect();
        if eligible.is_empty() {
            debug!("no eligible members to evaluate");
            return outcome;
        }

        // Score every eligible member.
        for member in &eligible {
            let score = self.score_member(member, input);
            outcome.scores.insert(member.name.clone(), score);
        }

        let primary = input.snapshot.primary();

        // Predictive signals for the current primary only.
        if input.config.main.predictive {
            if let Some(primary) = primary {
                if let Some(sample) = input.samples.get(&primary.name) {
                    let window = input.store.window(
                        &primary.name,
                        input.config.scoring.window,
                        input.now,
                    );
                    let track = self.tracks.entry(primary.name.clone()).or_default();
                    outcome.signals = track.predictive.assess(
                        sample,
                        &window,
                        &input.config.scoring,
                        input.wall.hour(),
                    );
                }
            }
        }

        // Manual actions bypass margin and dwell.
        if let Some(request) = input.manual {
            if let Some(decision) = self.manual_decision(request, primary, &outcome.scores, input) {
                outcome.decision = self.gate_backoff(decision, input.now);
                return outcome;
            }
            if matches!(request.action, ManualAction::Recheck) {
                debug!("manual recheck: continuing with normal evaluation");
            } else {
                return outcome;
            }
        }

        let decision = match primary {
            None => self.select_initial(&eligible, &outcome.scores, input),
            Some(primary) => self.consider_switch(primary, &eligible, &outcome, input),
        };
        outcome.near_miss = self.near_misses.back().filter(|nm| nm.at == input.now).cloned();
        outcome.decision = decision.and_then(|d| self.gate_backoff(d, input.now));
        outcome
    }

    /// Called after the controller ran (or dry-run skipped) the decision.
    /// On success the engine resets its backoff; on failure it backs off
    /// exponentially before re-emitting the same switch.
    pub fn record_apply_result(&mut self, decision: &Decision, now: MonoTime) {
        if decision.successful {
            self.backoff = None;
            self.last_primary = Some(decision.to_member.clone());
            // A completed switch resets dwell tracking.
            for track in self.tracks.values_mut() {
                track.superior_since = None;
            }
        } else {
            let attempt = self
                .backoff
                .as_ref()
                .filter(|b| b.to == decision.to_member)
                .map_or(0, |b| b.attempt)
                + 1;
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            let delay = APPLY_BACKOFF_BASE
                .saturating_mul(factor)
                .min(APPLY_BACKOFF_MAX);
            warn!(
                to = %decision.to_member,
                attempt,
                delay_s = delay.as_secs(),
                "controller failed to apply decision, backing off"
            );
            self.backoff = Some(ApplyBackoff {
                to: decision.to_member.clone(),
                until: now + delay,
                attempt,
            });
        }
    }

    fn gate_backoff(&mut self, decision: Decision, now: MonoTime) -> Option<Decision> {
        match &self.backoff {
            Some(backoff) if backoff.to == decision.to_member && !backoff.until.is_reached(now) => {
                debug!(to = %decision.to_member, "switch suppressed by apply backoff");
                None
            }
            _ => Some(decision),
        }
    }

    fn score_member(&mut self, member: &Member, input: &TickInput<'_>) -> Score {
        let sample = input
            .samples
            .get(&member.name)
            .cloned()
            .or_else(|| input.store.latest(&member.name));
        let Some(sample) = sample else {
            return Score::unusable();
        };

        let scoring = &input.config.scoring;
        let starlink = &input.config.starlink;
        let instant = scoring::instant_score(&sample, scoring, starlink);
        let track = self.tracks.entry(member.name.clone()).or_default();
        let ewma = track.keeper.update(instant, scoring.alpha.into_inner());
        let window = input
            .store
            .window(&member.name, scoring.window, input.now);
        let window_avg = scoring::window_average(&window, scoring, starlink).unwrap_or(instant);
        let blended = scoring::blend(instant, ewma, window_avg, scoring);
        Score {
            instant,
            ewma,
            window_avg,
            blended,
        }
    }

    /// Candidates ordered by (final desc, class preference, name asc).
    fn ranked<'m>(
        members: &[&'m Member],
        scores: &BTreeMap<MemberName, Score>,
    ) -> Vec<&'m Member> {
        let mut ranked: Vec<&Member> = members.to_vec();
        ranked.sort_by(|a, b| {
            let score_a = scores.get(&a.name).map_or(0.0, |s| s.blended);
            let score_b = scores.get(&b.name).map_or(0.0, |s| s.blended);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.class
                        .default_preference()
                        .cmp(&b.class.default_preference())
                })
                .then_with(|| a.name.cmp(&b.name))
        });
        ranked
    }

    fn select_initial(
        &mut self,
        eligible: &[&Member],
        scores: &BTreeMap<MemberName, Score>,
        input: &TickInput<'_>,
    ) -> Option<Decision> {
        let ranked = Self::ranked(eligible, scores);
        // Prefer candidates whose cooldown has elapsed; if everything is
        // cooling, availability wins over the cooldown.
        let best = ranked
            .iter()
            .find(|m| m.cooldown_elapsed(input.now))
            .or_else(|| ranked.first())?;

        let (reason, trigger) = match &self.last_primary {
            Some(last) if input.snapshot.get(last).is_none() => (
                DecisionReason::new(
                    ReasonKind::ConfigChange,
                    format!("previous primary {last} removed from configuration"),
                ),
                DecisionTrigger::Config,
            ),
            Some(last) => (
                DecisionReason::new(
                    ReasonKind::PrimaryIneligible,
                    format!("previous primary {last} is no longer eligible"),
                ),
                DecisionTrigger::Threshold,
            ),
            None => (
                DecisionReason::new(ReasonKind::InitialSelection, "no primary selected yet"),
                DecisionTrigger::Discovery,
            ),
        };

        info!(to = %best.name, reason = %reason.detail, "selecting primary");
        Some(self.build_decision(
            self.last_primary.clone(),
            best.name.clone(),
            reason,
            trigger,
            scores.clone(),
            input,
        ))
    }

    fn consider_switch(
        &mut self,
        primary: &Member,
        eligible: &[&Member],
        outcome: &TickOutcome,
        input: &TickInput<'_>,
    ) -> Option<Decision> {
        let scores = &outcome.scores;
        let config = &input.config;
        let primary_score = scores.get(&primary.name).copied().unwrap_or_else(Score::unusable);

        // Emergency obstruction on the primary short-circuits hysteresis.
        let emergency = input
            .samples
            .get(&primary.name)
            .and_then(|s| match &s.extras {
                ClassExtras::Starlink(extras) => {
                    Some(assess_obstruction(extras, &config.starlink.obstruction).emergency)
                }
                _ => None,
            })
            .unwrap_or(false);

        // Predictive signals reduce the primary's effective score during
        // comparison only.
        let reduction = if outcome.signals.is_empty() {
            0.0
        } else {
            config.scoring.predictive_margin
        };
        let effective_blended = (primary_score.blended - reduction).max(0.0);
        let effective_instant = (primary_score.instant - reduction).max(0.0);

        let candidates: Vec<&Member> = eligible
            .iter()
            .copied()
            .filter(|m| m.name != primary.name)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let ranked = Self::ranked(&candidates, scores);
        let best = *ranked.first()?;
        let best_score = scores.get(&best.name).copied().unwrap_or_else(Score::unusable);

        let margin = best_score.blended - effective_blended;
        // The dwell clock only runs while the freshest samples corroborate
        // the smoothed margin; otherwise EWMA inertia would keep the margin
        // open long after the primary has recovered.
        let instant_margin = best_score.instant - effective_instant;
        let raw_margin = best_score.blended - primary_score.blended;
        let required_margin = config.main.switch_margin.into_inner();

        if emergency {
            if !best.cooldown_elapsed(input.now) {
                warn!(candidate = %best.name, "emergency switch blocked by candidate cooldown");
                return None;
            }
            let reason = DecisionReason::new(
                ReasonKind::EmergencyObstruction,
                "obstruction crossed the emergency threshold",
            );
            info!(from = %primary.name, to = %best.name, "emergency obstruction failover");
            return Some(self.build_decision(
                Some(primary.name.clone()),
                best.name.clone(),
                reason,
                DecisionTrigger::Threshold,
                scores.clone(),
                input,
            ));
        }

        if margin < required_margin || instant_margin < required_margin {
            // Margin lost (or no longer corroborated by fresh samples):
            // reset dwell tracking for this candidate.
            if let Some(track) = self.tracks.get_mut(&best.name) {
                track.superior_since = None;
            }
            return None;
        }

        // Margin holds: track since when.
        let since = {
            let track = self.tracks.entry(best.name.clone()).or_default();
            *track.superior_since.get_or_insert(input.now)
        };
        let held = input.now.since(since);

        // Restoring to a more preferred class needs the longer dwell, but an
        // unusable primary does not earn it.
        let restoring = best.class.default_preference() < primary.class.default_preference()
            && primary_score.instant > 0.0;
        let required_dwell = if restoring {
            config.main.fail_min_duration.max(config.main.restore_min_duration)
        } else {
            config.main.fail_min_duration
        };

        if held < required_dwell {
            let near_miss = NearMiss {
                at: input.now,
                candidate: best.name.clone(),
                primary: primary.name.clone(),
                margin,
                held_for: held,
                required: required_dwell,
            };
            debug!(
                candidate = %near_miss.candidate,
                margin = near_miss.margin,
                held_ms = held.as_millis() as u64,
                "switch margin met but dwell not yet satisfied"
            );
            if self.near_misses.len() >= NEAR_MISS_CAP {
                self.near_misses.pop_front();
            }
            self.near_misses.push_back(near_miss);
            return None;
        }

        // Cooldowns on both sides.
        if !primary.cooldown_elapsed(input.now) || !best.cooldown_elapsed(input.now) {
            debug!(
                from = %primary.name,
                to = %best.name,
                "switch blocked by cooldown"
            );
            return None;
        }

        let (reason, trigger) = if raw_margin < required_margin {
            // Only the predictive reduction pushed this over the margin.
            (
                DecisionReason::new(
                    ReasonKind::PredictiveDegradation,
                    format!(
                        "imminent degradation predicted for {}; {} ahead by {margin:.1}",
                        primary.name, best.name
                    ),
                ),
                DecisionTrigger::Predictive,
            )
        } else {
            (
                DecisionReason::new(
                    ReasonKind::BetterCandidate,
                    format!(
                        "{} ahead of {} by {raw_margin:.1} points for {}s",
                        best.name,
                        primary.name,
                        held.as_secs()
                    ),
                ),
                DecisionTrigger::Threshold,
            )
        };

        info!(from = %primary.name, to = %best.name, margin = raw_margin, "switching primary");
        Some(self.build_decision(
            Some(primary.name.clone()),
            best.name.clone(),
            reason,
            trigger,
            scores.clone(),
            input,
        ))
    }

    fn manual_decision(
        &mut self,
        request: &ManualRequest,
        primary: Option<&Member>,
        scores: &BTreeMap<MemberName, Score>,
        input: &TickInput<'_>,
    ) -> Option<Decision> {
        let eligible: Vec<&Member> = input.snapshot.eligible().collect();
        let target: &Member = match &request.action {
            ManualAction::Recheck => return None,
            ManualAction::Switch(name) => eligible.iter().find(|m| &m.name == name).copied()?,
            ManualAction::Failover => {
                let others: Vec<&Member> = eligible
                    .iter()
                    .copied()
                    .filter(|m| primary.is_none_or(|p| p.name != m.name))
                    .collect();
                *Self::ranked(&others, scores).first()?
            }
            ManualAction::Restore => {
                let mut ranked = Self::ranked(&eligible, scores);
                ranked.sort_by_key(|m| m.class.default_preference());
                let best = *ranked.first()?;
                if primary.is_some_and(|p| p.name == best.name) {
                    return None;
                }
                best
            }
        };
        if primary.is_some_and(|p| p.name == target.name) {
            debug!(member = %target.name, "manual action targets current primary, nothing to do");
            return None;
        }
        if !request.force {
            let primary_cooling = primary.is_some_and(|p| !p.cooldown_elapsed(input.now));
            if primary_cooling || !target.cooldown_elapsed(input.now) {
                warn!(
                    member = %target.name,
                    "manual action blocked by cooldown (use force to override)"
                );
                return None;
            }
        }
        let reason = DecisionReason::new(
            ReasonKind::ManualAction,
            format!("operator requested {:?}", request.action),
        );
        info!(to = %target.name, "manual switch");
        Some(self.build_decision(
            primary.map(|p| p.name.clone()),
            target.name.clone(),
            reason,
            DecisionTrigger::Manual,
            scores.clone(),
            input,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_decision(
        &self,
        from: Option<MemberName>,
        to: MemberName,
        reason: DecisionReason,
        trigger: DecisionTrigger,
        scores: BTreeMap<MemberName, Score>,
        input: &TickInput<'_>,
    ) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            at_wall: input.wall,
            at_mono: input.now,
            from_member: from,
            to_member: to,
            reason,
            trigger,
            scores,
            successful: false,
            error: None,
            duration_ms: 0,
            dry_run: input.config.main.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RawConfig};
    use crate::domain_types::InterfaceName;
    use crate::member::{CollectionMethod, MemberClass, MemberState};
    use crate::telemetry::{StoreLimits, TelemetryStore};

    fn name(s: &str) -> MemberName {
        MemberName::try_new(s.to_string()).unwrap()
    }

    fn config() -> Config {
        Config::from_raw(&RawConfig::default()).unwrap()
    }

    fn store() -> TelemetryStore {
        TelemetryStore::new(StoreLimits::derive(
            Duration::from_secs(1),
            Duration::from_secs(600),
            Duration::from_secs(300),
            64 * 1024 * 1024,
        ))
    }

    fn member(n: &str, class: MemberClass, state: MemberState) -> Member {
        Member {
            name: name(n),
            class,
            interface: InterfaceName::try_new("wan".to_string()).unwrap(),
            sim_slot: None,
            dish_endpoint: None,
            state,
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

    fn sample(member: &MemberName, at: MonoTime, latency: f64, loss: f64) -> Sample {
        Sample {
            member: member.clone(),
            at_mono: at,
            at_wall: chrono::Utc::now(),
            latency_ms: latency,
            loss_pct: loss,
            jitter_ms: 2.0,
            signal_dbm: None,
            extras: ClassExtras::None,
            method: CollectionMethod::Primary,
            error: None,
            collected_in_ms: 10,
        }
    }

    struct Harness {
        config: Config,
        store: TelemetryStore,
        engine: DecisionEngine,
        members: Vec<Member>,
    }

    impl Harness {
        fn new(members: Vec<Member>) -> Self {
            Self {
                config: config(),
                store: store(),
                engine: DecisionEngine::new(),
                members,
            }
        }

        fn tick(
            &mut self,
            now_ms: u64,
            samples: Vec<Sample>,
            manual: Option<&ManualRequest>,
        ) -> TickOutcome {
            let now = MonoTime::from_millis(now_ms);
            let mut map = BTreeMap::new();
            for s in samples {
                self.store.append(s.clone());
                map.insert(s.member.clone(), s);
            }
            let snapshot = RegistrySnapshot {
                members: self.members.clone(),
                generation: 1,
            };
            let input = TickInput {
                now,
                wall: chrono::Utc::now(),
                config: &self.config,
                snapshot: &snapshot,
                store: &self.store,
                samples: &map,
                manual,
            };
            self.engine.evaluate(&input)
        }

        fn promote(&mut self, n: &str) {
            for m in &mut self.members {
                m.state = if m.name.as_str() == n {
                    MemberState::Primary
                } else {
                    MemberState::Candidate
                };
            }
        }
    }

    #[test]
    fn test_initial_selection_picks_best() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");
        let outcome = h.tick(
            1000,
            vec![
                sample(&starlink, MonoTime::from_millis(1000), 40.0, 0.1),
                sample(&cellular, MonoTime::from_millis(1000), 80.0, 0.5),
            ],
            None,
        );
        let decision = outcome.decision.expect("initial selection");
        assert_eq!(decision.to_member, starlink);
        assert_eq!(decision.trigger, DecisionTrigger::Discovery);
        assert_eq!(decision.reason.kind, ReasonKind::InitialSelection);
        assert!(decision.from_member.is_none());
    }

    #[test]
    fn test_margin_below_threshold_produces_no_decision() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        h.promote("starlink_any");
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");
        // Nearly identical quality: no switch.
        for t in 0..5u64 {
            let outcome = h.tick(
                t * 1000,
                vec![
                    sample(&starlink, MonoTime::from_millis(t * 1000), 42.0, 0.2),
                    sample(&cellular, MonoTime::from_millis(t * 1000), 40.0, 0.2),
                ],
                None,
            );
            assert!(outcome.decision.is_none(), "tick {t}");
        }
    }

    #[test]
    fn test_switch_requires_dwell_then_fires() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        h.promote("starlink_any");
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");
        let dwell_ms = h.config.main.fail_min_duration.as_millis() as u64;

        let mut fired_at = None;
        for t in 0..40u64 {
            let now = t * 1000;
            let outcome = h.tick(
                now,
                vec![
                    // Heavy loss on the primary.
                    sample(&starlink, MonoTime::from_millis(now), 60.0, 12.0),
                    sample(&cellular, MonoTime::from_millis(now), 60.0, 0.1),
                ],
                None,
            );
            if let Some(decision) = outcome.decision {
                assert_eq!(decision.to_member, cellular);
                assert_eq!(decision.trigger, DecisionTrigger::Threshold);
                fired_at = Some(now);
                break;
            }
        }
        let fired_at = fired_at.expect("switch must fire");
        assert!(
            fired_at >= dwell_ms && fired_at <= dwell_ms + 3000,
            "fired at {fired_at}ms, dwell {dwell_ms}ms"
        );
    }

    #[test]
    fn test_transient_spike_records_near_miss_only() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        h.promote("starlink_any");
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");

        let mut near_misses = 0;
        for t in 0..35u64 {
            let now = t * 1000;
            let loss = if t < 10 { 12.0 } else { 0.2 };
            let outcome = h.tick(
                now,
                vec![
                    sample(&starlink, MonoTime::from_millis(now), 60.0, loss),
                    sample(&cellular, MonoTime::from_millis(now), 60.0, 0.1),
                ],
                None,
            );
            assert!(outcome.decision.is_none(), "no switch on a 10s spike");
            if outcome.near_miss.is_some() {
                near_misses += 1;
            }
        }
        assert!(near_misses > 0, "near-miss must be recorded");
    }

    #[test]
    fn test_primary_ineligible_switches_immediately() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        h.promote("starlink_any");
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");

        // Establish engine's notion of the primary.
        let outcome = h.tick(
            0,
            vec![
                sample(&starlink, MonoTime::ZERO, 40.0, 0.1),
                sample(&cellular, MonoTime::ZERO, 60.0, 0.2),
            ],
            None,
        );
        assert!(outcome.decision.is_none());
        h.engine.last_primary = Some(starlink.clone());

        // Primary drops out of the eligible set entirely.
        for m in &mut h.members {
            if m.name == starlink {
                m.eligible = false;
                m.state = MemberState::Cooling;
            }
        }
        let outcome = h.tick(
            1000,
            vec![sample(&cellular, MonoTime::from_millis(1000), 60.0, 0.2)],
            None,
        );
        let decision = outcome.decision.expect("immediate switch");
        assert_eq!(decision.to_member, cellular);
        assert_eq!(decision.reason.kind, ReasonKind::PrimaryIneligible);
        assert_eq!(decision.trigger, DecisionTrigger::Threshold);
    }

    #[test]
    fn test_cooldown_blocks_switch() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        h.promote("starlink_any");
        // Candidate still cooling.
        for m in &mut h.members {
            if m.name.as_str() == "cellular_sim1" {
                m.cooldown_until = Some(MonoTime::from_millis(120_000));
            }
        }
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");

        for t in 0..40u64 {
            let now = t * 1000;
            let outcome = h.tick(
                now,
                vec![
                    sample(&starlink, MonoTime::from_millis(now), 60.0, 12.0),
                    sample(&cellular, MonoTime::from_millis(now), 60.0, 0.1),
                ],
                None,
            );
            assert!(outcome.decision.is_none(), "cooldown must block the switch");
        }
    }

    #[test]
    fn test_manual_switch_bypasses_margin_and_dwell() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        h.promote("starlink_any");
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");

        let action = ManualRequest {
            action: ManualAction::Switch(cellular.clone()),
            force: false,
        };
        let outcome = h.tick(
            1000,
            vec![
                sample(&starlink, MonoTime::from_millis(1000), 40.0, 0.1),
                sample(&cellular, MonoTime::from_millis(1000), 80.0, 0.5),
            ],
            Some(&action),
        );
        let decision = outcome.decision.expect("manual switch");
        assert_eq!(decision.to_member, cellular);
        assert_eq!(decision.trigger, DecisionTrigger::Manual);
    }

    #[test]
    fn test_apply_failure_backs_off_reemission() {
        let mut h = Harness::new(vec![
            member("starlink_any", MemberClass::Starlink, MemberState::Candidate),
            member("cellular_sim1", MemberClass::Cellular, MemberState::Candidate),
        ]);
        h.promote("starlink_any");
        let starlink = name("starlink_any");
        let cellular = name("cellular_sim1");
        let dwell_ms = h.config.main.fail_min_duration.as_millis() as u64;

        // Drive to a decision.
        let mut decision = None;
        for t in 0..=(dwell_ms / 1000 + 2) {
            let now = t * 1000;
            let outcome = h.tick(
                now,
                vec![
                    sample(&starlink, MonoTime::from_millis(now), 60.0, 12.0),
                    sample(&cellular, MonoTime::from_millis(now), 60.0, 0.1),
                ],
                None,
            );
            if outcome.decision.is_some() {
                decision = outcome.decision;
                break;
            }
        }
        let mut decision = decision.expect("decision fires");
        let fired_ms = decision.at_mono.as_millis();

        // Controller failed.
        decision.successful = false;
        h.engine.record_apply_result(&decision, decision.at_mono);

        // Immediately after, the same switch is suppressed.
        let now = fired_ms + 1000;
        let outcome = h.tick(
            now,
            vec![
                sample(&starlink, MonoTime::from_millis(now), 60.0, 12.0),
                sample(&cellular, MonoTime::from_millis(now), 60.0, 0.1),
            ],
            None,
        );
        assert!(outcome.decision.is_none(), "backoff suppresses re-emission");

        // After the backoff window it re-emits.
        let now = fired_ms + APPLY_BACKOFF_BASE.as_millis() as u64 + 2000;
        let outcome = h.tick(
            now,
            vec![
                sample(&starlink, MonoTime::from_millis(now), 60.0, 12.0),
                sample(&cellular, MonoTime::from_millis(now), 60.0, 0.1),
            ],
            None,
        );
        assert!(outcome.decision.is_some(), "switch retried after backoff");
    }

    #[test]
    fn test_tie_breaks_deterministically() {
        let a = member("aaa", MemberClass::Cellular, MemberState::Candidate);
        let b = member("bbb", MemberClass::Cellular, MemberState::Candidate);
        let mut scores = BTreeMap::new();
        scores.insert(name("aaa"), Score { instant: 50.0, ewma: 50.0, window_avg: 50.0, blended: 50.0 });
        scores.insert(name("bbb"), Score { instant: 50.0, ewma: 50.0, window_avg: 50.0, blended: 50.0 });
        let members = [&a, &b];
        let ranked = DecisionEngine::ranked(&members, &scores);
        assert_eq!(ranked[0].name, name("aaa"), "name ascending breaks ties");
    }
}
