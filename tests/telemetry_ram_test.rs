//! RAM-cap enforcement under sustained load
//!
//! At `telemetry.max_ram_mb`, continued appends must downsample into
//! buckets rather than drop ticks, and the accounted total must stay under
//! the cap throughout.

mod common;

use common::{FakeRouteEngine, MemberSpec, build_harness};
use starfail::domain_types::MemberName;
use std::time::Duration;

const SMALL_RAM_UCI: &str = r"
config starfail 'main'
	option poll_interval_ms '1000'

config starfail 'telemetry'
	option max_ram_mb '1'
	option retention_seconds '86400'

config member 'member_starlink_any'
	option class 'starlink'
	option interface 'wan'

config member 'member_cellular_sim1'
	option class 'cellular'
	option interface 'wwan0'
";

fn name(s: &str) -> MemberName {
    MemberName::try_new(s.to_string()).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_ram_stays_under_cap_with_downsampling() {
    let mut h = build_harness(SMALL_RAM_UCI, FakeRouteEngine::honest()).await;
    h.seed_primary("starlink_any").await;
    h.conditions.set("starlink_any", MemberSpec::clean(40.0, 0.2));
    h.conditions.set("cellular_sim1", MemberSpec::clean(60.0, 0.1));

    let cap = 1024 * 1024;
    // An hour of ticks at 1s in chunks, checking the cap as we go.
    for _ in 0..36 {
        h.run_seconds(100).await;
        assert!(
            h.store.ram_bytes() <= cap,
            "telemetry ram {} exceeded cap {}",
            h.store.ram_bytes(),
            cap
        );
    }

    // Ticks were never dropped: the freshest sample is from the last tick.
    let latest = h.store.latest(&name("starlink_any")).unwrap();
    assert_eq!(latest.at_mono.as_millis(), 3600 * 1000);

    // Shed samples are reachable as aggregates.
    let buckets = h.store.aggregate(&name("starlink_any"));
    let hi = h
        .store
        .window(&name("starlink_any"), Duration::from_secs(86_400), latest.at_mono);
    let folded: u32 = buckets.iter().map(|b| b.count).sum();
    assert_eq!(
        folded as usize + hi.len(),
        3600,
        "every appended sample is either hi-res or aggregated"
    );
    assert!(!buckets.is_empty(), "the cap forced downsampling");
}
