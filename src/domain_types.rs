//! Domain types for the starfail daemon
//!
//! Strongly-typed values for every config-carried scalar so invalid knobs are
//! rejected at the boundary instead of deep inside the control loop.

use nutype::nutype;
use std::time::Duration;

/// Minimum accepted poll interval in milliseconds.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Stable name of a managed uplink, e.g. `starlink_any` or `cellular_sim1`.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct MemberName(String);

/// OS-level interface name, e.g. `wan`, `wwan0`, `wlan0`.
#[nutype(
    validate(len_char_min = 1, len_char_max = 32),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct InterfaceName(String);

/// Poll interval in milliseconds, floor 100 ms, ceiling one hour.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 3_600_000),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TryFrom, Into)
)]
pub struct PollIntervalMs(u64);

impl PollIntervalMs {
    /// The interval as a `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Score-point margin a candidate must exceed the primary by before a switch.
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 100.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, TryFrom, Into)
)]
pub struct SwitchMargin(f64);

/// Consecutive-failure count that flips a member ineligible.
#[nutype(
    validate(greater = 0, less_or_equal = 1000),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TryFrom, Into)
)]
pub struct FailThreshold(u32);

/// Telemetry RAM ceiling in megabytes.
#[nutype(
    validate(greater = 0, less_or_equal = 1024),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TryFrom, Into)
)]
pub struct RamBudgetMb(u64);

impl RamBudgetMb {
    /// Budget in bytes.
    #[must_use]
    pub fn as_bytes(self) -> usize {
        usize::try_from(self.into_inner()).unwrap_or(usize::MAX) * 1024 * 1024
    }
}

/// Routing metric assigned to a member. Lower is preferred by the engine.
#[nutype(
    validate(greater = 0, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct RouteMetric(u32);

/// EWMA smoothing factor for the instant score.
#[nutype(
    validate(finite, greater = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, TryFrom, Into)
)]
pub struct EwmaAlpha(f64);

/// One coefficient of the instant/ewma/window blend.
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, TryFrom, Into)
)]
pub struct BlendWeight(f64);

/// TCP port of the dish gRPC endpoint.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct DishPort(u16);

/// Upper bound on concurrently running collector tasks per tick.
#[nutype(
    validate(greater = 0, less_or_equal = 64),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TryFrom, Into)
)]
pub struct WorkerPoolSize(usize);
