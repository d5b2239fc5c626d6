//! Scheduler tick guarantees
//!
//! Every collectable member yields exactly one sample per tick, collector
//! panics are contained (the member gets a sentinel and the loop survives),
//! and a disabled daemon stops deciding without stopping to serve state.

mod common;

use common::{FakeRouteEngine, MemberSpec, TWO_MEMBER_UCI, build_harness};
use starfail::domain_types::MemberName;
use std::time::Duration;

fn name(s: &str) -> MemberName {
    MemberName::try_new(s.to_string()).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_every_collectable_member_gets_one_sample_per_tick() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    h.conditions.set("starlink_any", MemberSpec::clean(40.0, 0.2));
    h.conditions.set("cellular_sim1", MemberSpec::clean(60.0, 0.1));

    h.run_seconds(3).await;

    for member in ["starlink_any", "cellular_sim1"] {
        let latest = h.store.latest(&name(member)).unwrap();
        assert_eq!(
            latest.at_mono.as_millis(),
            3000,
            "{member} sampled on the latest tick"
        );
        let window = h
            .store
            .window(&name(member), Duration::from_secs(60), latest.at_mono);
        assert_eq!(window.len(), 3, "{member}: one sample per tick");
    }
}

#[test_log::test(tokio::test)]
async fn test_collector_panic_is_contained() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    h.conditions.set("starlink_any", MemberSpec::clean(40.0, 0.2));
    h.conditions.set("cellular_sim1", MemberSpec::clean(60.0, 0.1));
    h.run_seconds(2).await;

    // The starlink collector starts panicking.
    h.conditions.set_panicking("starlink_any", true);
    h.run_seconds(2).await;

    // The loop survived and the member got sentinel samples.
    let latest = h.store.latest(&name("starlink_any")).unwrap();
    assert!(latest.is_sentinel(), "panicked collector yields a sentinel");
    assert_eq!(latest.at_mono.as_millis(), 4000);
    // The healthy member is unaffected.
    let healthy = h.store.latest(&name("cellular_sim1")).unwrap();
    assert!(!healthy.is_sentinel());

    // The worker is respawned next tick; recovery is immediate.
    h.conditions.set_panicking("starlink_any", false);
    h.run_seconds(1).await;
    let recovered = h.store.latest(&name("starlink_any")).unwrap();
    assert!(!recovered.is_sentinel());
}

#[test_log::test(tokio::test)]
async fn test_unreachable_dish_never_promotes_starlink_over_healthy_backup() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    // Dish down the whole run: Starlink collects through the ping fallback
    // with decent latency, the cellular backup is healthy.
    h.conditions.set(
        "starlink_any",
        MemberSpec::ping_fallback(40.0, 0.2, "dish rpc failed: connection refused"),
    );
    h.conditions.set("cellular_sim1", MemberSpec::clean(60.0, 0.1));

    h.run_seconds(60).await;

    let snapshot = h.registry.snapshot().await;
    assert_eq!(
        snapshot.primary().unwrap().name,
        name("cellular_sim1"),
        "a dish-less starlink must not win on ping latency alone"
    );

    // Starlink becomes primary only once it is the sole eligible member.
    h.conditions.set("cellular_sim1", MemberSpec::clean(0.0, 100.0));
    h.run_seconds(40).await;
    let snapshot = h.registry.snapshot().await;
    assert_eq!(snapshot.primary().unwrap().name, name("starlink_any"));
}

#[test_log::test(tokio::test)]
async fn test_disabled_daemon_stops_deciding() {
    let mut h = build_harness(TWO_MEMBER_UCI, FakeRouteEngine::honest()).await;
    h.seed_primary("starlink_any").await;
    h.conditions.set("starlink_any", MemberSpec::clean(60.0, 12.0));
    h.conditions.set("cellular_sim1", MemberSpec::clean(60.0, 0.1));

    h.config.set("main.enable", "0").unwrap();
    h.run_seconds(40).await;

    assert!(h.switch_decisions().is_empty(), "disabled daemon never switches");
    assert!(
        h.store.latest(&name("starlink_any")).is_none(),
        "disabled daemon skips collection entirely"
    );
}
