//! End-to-end failover scenarios driven through the full scheduler
//!
//! Scripted collectors and a fake routing engine replay the reference
//! scenarios: clean failover on sustained loss, no flapping on transient
//! spikes, and hot-reloaded hysteresis knobs taking effect on the next tick.

mod common;

use common::{FakeRouteEngine, MemberSpec, TWO_MEMBER_UCI, build_harness};
use starfail::config::{DEFAULT_METRIC_BAD, DEFAULT_METRIC_GOOD};
use starfail::domain_types::MemberName;
use starfail::member::{DecisionTrigger, MemberState};

fn name(s: &str) -> MemberName {
    MemberName::try_new(s.to_string()).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_clean_failover_on_sustained_loss() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    h.seed_primary("starlink_any").await;
    h.conditions.set("starlink_any", MemberSpec::clean(40.0, 0.2));
    h.conditions.set("cellular_sim1", MemberSpec::clean(60.0, 0.1));

    // 10 healthy seconds.
    h.run_seconds(10).await;
    assert!(h.switch_decisions().is_empty());

    // Starlink takes 12% loss for 30 seconds.
    h.conditions.set("starlink_any", MemberSpec::clean(60.0, 12.0));
    h.run_seconds(30).await;

    let decisions = h.switch_decisions();
    assert_eq!(decisions.len(), 1, "exactly one switch decision");
    let decision = &decisions[0];
    assert_eq!(decision.to_member, name("cellular_sim1"));
    assert_eq!(decision.from_member.as_ref(), Some(&name("starlink_any")));
    assert_eq!(decision.trigger, DecisionTrigger::Threshold);
    assert!(decision.successful);

    // fail_min_duration_s is 20; the fault started at t=10s.
    let fired_s = decision.at_mono.as_millis() / 1000;
    assert!(
        (30..=33).contains(&fired_s),
        "decision fired at t={fired_s}s, expected ~30-32s"
    );

    // Metrics: new primary GOOD, demoted member the constant BAD.
    let log = h.engine.metric_log.lock().clone();
    assert!(log.contains(&("cellular_sim1".to_string(), DEFAULT_METRIC_GOOD)));
    assert!(log.contains(&("starlink_any".to_string(), DEFAULT_METRIC_BAD)));

    // Starlink recovers; within the 60s cooldown nothing else may switch,
    // and re-running ticks with unchanged inputs adds no decisions.
    h.conditions.set("starlink_any", MemberSpec::clean(40.0, 0.2));
    h.run_seconds(55).await;
    assert_eq!(h.switch_decisions().len(), 1, "no second switch inside cooldown");

    let snapshot = h.registry.snapshot().await;
    assert_eq!(snapshot.primary().unwrap().name, name("cellular_sim1"));
    assert_eq!(
        snapshot.get(&name("starlink_any")).unwrap().state,
        MemberState::Candidate,
        "starlink recovered to candidate after its cooldown"
    );
}

#[test_log::test(tokio::test)]
async fn test_no_flap_on_transient_spike() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    h.seed_primary("starlink_any").await;
    h.conditions.set("starlink_any", MemberSpec::clean(40.0, 0.2));
    h.conditions.set("cellular_sim1", MemberSpec::clean(60.0, 0.1));
    h.run_seconds(10).await;

    // A 10-second spike, shorter than fail_min_duration_s = 20.
    h.conditions.set("starlink_any", MemberSpec::clean(60.0, 12.0));
    h.run_seconds(10).await;
    h.conditions.set("starlink_any", MemberSpec::clean(40.0, 0.2));
    h.run_seconds(40).await;

    assert!(
        h.switch_decisions().is_empty(),
        "transient spike must not cause a switch"
    );
    let snapshot = h.registry.snapshot().await;
    assert_eq!(snapshot.primary().unwrap().name, name("starlink_any"));
}

#[test_log::test(tokio::test)]
async fn test_hot_reloaded_margin_takes_effect_next_tick() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    h.seed_primary("starlink_any").await;
    // Cellular is consistently ~7 points ahead: below the configured margin
    // of 10, above the margin we are about to set.
    h.conditions.set("starlink_any", MemberSpec::clean(60.0, 0.2));
    h.conditions.set("cellular_sim1", MemberSpec::clean(40.0, 0.1));

    h.run_seconds(30).await;
    assert!(h.switch_decisions().is_empty(), "margin 10 blocks the switch");

    // Operator lowers the margin through the RPC config effect.
    h.config.set("main.switch_margin", "2").unwrap();
    h.run_seconds(25).await;

    let decisions = h.switch_decisions();
    assert_eq!(decisions.len(), 1, "margin 2 lets the switch through");
    let fired_s = decisions[0].at_mono.as_millis() / 1000;
    // Margin was lowered at t=30s; the dwell is 20s.
    assert!(
        (50..=53).contains(&fired_s),
        "decision fired at t={fired_s}s, expected ~50-52s"
    );
}

#[test_log::test(tokio::test)]
async fn test_switch_threshold_alias_reaches_engine() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    h.seed_primary("starlink_any").await;
    h.conditions.set("starlink_any", MemberSpec::clean(60.0, 0.2));
    h.conditions.set("cellular_sim1", MemberSpec::clean(40.0, 0.1));

    h.run_seconds(5).await;
    h.config.set("scoring.switch_threshold", "2").unwrap();
    h.run_seconds(25).await;

    assert_eq!(h.switch_decisions().len(), 1, "alias lowers the live margin");
}
