//! Core data model: members, samples, scores, and decisions
//!
//! Everything the control loop passes between components lives here. Samples
//! are immutable once produced; members transition state only through the
//! decision engine; decisions are append-only audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain_types::{InterfaceName, MemberName, RouteMetric};
use crate::time_provider::MonoTime;

/// Uplink class of a managed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberClass {
    /// Starlink dish reached over gRPC.
    Starlink,
    /// Cellular modem (one member per SIM).
    Cellular,
    /// Wi-Fi station uplink.
    Wifi,
    /// Wired uplink probed by ping only.
    Lan,
}

impl MemberClass {
    /// Stable lowercase name used in config sections and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MemberClass::Starlink => "starlink",
            MemberClass::Cellular => "cellular",
            MemberClass::Wifi => "wifi",
            MemberClass::Lan => "lan",
        }
    }

    /// Parses a class name as written in config.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starlink" => Some(MemberClass::Starlink),
            "cellular" => Some(MemberClass::Cellular),
            "wifi" => Some(MemberClass::Wifi),
            "lan" => Some(MemberClass::Lan),
            _ => None,
        }
    }

    /// Default restoration preference rank. Lower ranks are preferred; a
    /// switch back to a lower rank requires the restore dwell.
    #[must_use]
    pub fn default_preference(self) -> u8 {
        match self {
            MemberClass::Starlink => 0,
            MemberClass::Lan => 1,
            MemberClass::Wifi => 2,
            MemberClass::Cellular => 3,
        }
    }
}

impl std::fmt::Display for MemberClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a member.
///
/// ```text
/// candidate ──decision──▶ primary ──switch-away / failures──▶ cooling
///     ▲                                                          │
///     └────────── cooldown elapsed + one good sample ────────────┘
/// any ──errors ≥ hard_fail_threshold──▶ failed
/// any ──config──▶ disabled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    /// Eligible backup, ready to be promoted.
    Candidate,
    /// Currently selected to carry traffic.
    Primary,
    /// Recently switched away or failed; waiting out its cooldown.
    Cooling,
    /// Exceeded the hard failure threshold; needs sustained recovery.
    Failed,
    /// Excluded by configuration.
    Disabled,
}

impl MemberState {
    /// Whether the state machine permits a transition to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: MemberState) -> bool {
        use MemberState::{Candidate, Cooling, Disabled, Failed, Primary};
        match (self, next) {
            // Disabling and hard-failing are allowed from anywhere.
            (_, Disabled) | (_, Failed) => true,
            (Candidate, Primary) | (Candidate, Cooling) => true,
            (Primary, Cooling) => true,
            (Cooling, Candidate) => true,
            (Failed, Cooling) | (Failed, Candidate) => true,
            (Disabled, Candidate) => true,
            (a, b) => a == b,
        }
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemberState::Candidate => "candidate",
            MemberState::Primary => "primary",
            MemberState::Cooling => "cooling",
            MemberState::Failed => "failed",
            MemberState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Rejected member state transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid member state transition {from} -> {to}")]
pub struct StateTransitionError {
    /// State the member was in.
    pub from: MemberState,
    /// State the transition asked for.
    pub to: MemberState,
}

/// A managed uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Stable name, unique across the registry.
    pub name: MemberName,
    /// Uplink class.
    pub class: MemberClass,
    /// OS-level interface the uplink rides on.
    pub interface: InterfaceName,
    /// SIM slot for cellular members.
    pub sim_slot: Option<u8>,
    /// Dish endpoint override for Starlink members (`ip:port`).
    pub dish_endpoint: Option<String>,
    /// Current lifecycle state.
    pub state: MemberState,
    /// Whether the engine may consider this member for primary.
    pub eligible: bool,
    /// Whether discovery has seen the underlying interface.
    pub detected: bool,
    /// Whether configuration enables this member at all.
    pub enabled: bool,
    /// Until when the member sits out switch participation.
    pub cooldown_until: Option<MonoTime>,
    /// Consecutive full-ladder collection failures.
    pub consecutive_errors: u32,
    /// Consecutive successful collections, used for failed-state recovery.
    pub consecutive_ok: u32,
    /// Last time a collection succeeded.
    pub last_seen_ok: Option<MonoTime>,
    /// Per-member metric override for the preferred slot.
    pub metric_good: Option<RouteMetric>,
    /// Per-member metric override for the demoted slot.
    pub metric_bad: Option<RouteMetric>,
}

impl Member {
    /// Transition the member's state, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns `StateTransitionError` when the machine forbids the move.
    pub fn transition_to(&mut self, next: MemberState) -> Result<(), StateTransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(StateTransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Whether the member's cooldown has elapsed at `now`.
    #[must_use]
    pub fn cooldown_elapsed(&self, now: MonoTime) -> bool {
        self.cooldown_until.is_none_or(|until| until.is_reached(now))
    }
}

/// How a sample's measurements were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionMethod {
    /// The class's native API answered.
    Primary,
    /// The native API partially failed; a secondary provider filled in.
    Degraded,
    /// Only the interface-bound ping burst produced data.
    PingFallback,
    /// Derived from counters or a sentinel; weakest confidence.
    Estimated,
}

impl std::fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectionMethod::Primary => "primary",
            CollectionMethod::Degraded => "degraded",
            CollectionMethod::PingFallback => "ping-fallback",
            CollectionMethod::Estimated => "estimated",
        };
        f.write_str(s)
    }
}

/// Alert bits reported by the dish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DishAlerts {
    /// Dish is thermally throttling.
    pub thermal_throttle: bool,
    /// Dish has shut down from heat; unusable.
    pub thermal_shutdown: bool,
    /// A software update is staged and a reboot is pending.
    pub reboot_ready: bool,
    /// Dish reports it is roaming away from its home cell.
    pub roaming: bool,
}

/// Starlink-specific sample fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarlinkExtras {
    /// Signal-to-noise ratio in dB.
    pub snr: Option<f64>,
    /// Whether SNR currently clears the noise floor.
    pub snr_above_noise_floor: Option<bool>,
    /// Whether the dish flags SNR as persistently low.
    pub snr_persistently_low: Option<bool>,
    /// Currently obstructed fraction of the sky, 0..1.
    pub fraction_obstructed: Option<f64>,
    /// Historical fraction of time spent obstructed, 0..1.
    pub time_obstructed: Option<f64>,
    /// Average length of prolonged obstruction intervals, seconds.
    pub avg_prolonged_obstruction_s: Option<f64>,
    /// Seconds of valid obstruction measurements backing the stats.
    pub valid_s: Option<f64>,
    /// Valid measurement patches backing the obstruction map.
    pub patches_valid: Option<u32>,
    /// Dish uptime in seconds.
    pub uptime_s: Option<u64>,
    /// Device alert bits.
    pub alerts: DishAlerts,
}

/// Cellular-specific sample fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellularExtras {
    /// Reference signal received power, dBm.
    pub rsrp_dbm: Option<f64>,
    /// Reference signal received quality, dB.
    pub rsrq_db: Option<f64>,
    /// Signal-to-interference-plus-noise ratio, dB.
    pub sinr_db: Option<f64>,
    /// Radio technology, e.g. `LTE`, `5G NSA`.
    pub technology: Option<String>,
    /// Operator name as reported by the modem.
    pub operator: Option<String>,
    /// Whether the SIM is roaming.
    pub roaming: bool,
    /// Interface receive counter at collection time.
    pub rx_bytes: Option<u64>,
    /// Interface transmit counter at collection time.
    pub tx_bytes: Option<u64>,
}

/// Wi-Fi-specific sample fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiExtras {
    /// Negotiated link rate, Mbit/s.
    pub bitrate_mbit: Option<f64>,
    /// True when the interface runs in station mode. AP-mode members are
    /// not usable as uplinks.
    pub station_mode: bool,
}

/// Class-specific sample payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassExtras {
    /// No class-specific data (LAN, sentinel samples).
    #[default]
    None,
    /// Starlink dish data.
    Starlink(StarlinkExtras),
    /// Cellular modem data.
    Cellular(CellularExtras),
    /// Wi-Fi station data.
    Wifi(WifiExtras),
}

impl ClassExtras {
    /// Starlink payload, if present.
    #[must_use]
    pub fn starlink(&self) -> Option<&StarlinkExtras> {
        match self {
            ClassExtras::Starlink(extras) => Some(extras),
            _ => None,
        }
    }

    /// Cellular payload, if present.
    #[must_use]
    pub fn cellular(&self) -> Option<&CellularExtras> {
        match self {
            ClassExtras::Cellular(extras) => Some(extras),
            _ => None,
        }
    }

    /// Wi-Fi payload, if present.
    #[must_use]
    pub fn wifi(&self) -> Option<&WifiExtras> {
        match self {
            ClassExtras::Wifi(extras) => Some(extras),
            _ => None,
        }
    }
}

/// Immutable result of one collection for one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Member this sample belongs to.
    pub member: MemberName,
    /// Monotonic collection timestamp.
    pub at_mono: MonoTime,
    /// Wall-clock collection timestamp.
    pub at_wall: DateTime<Utc>,
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Packet loss percentage, 0..100.
    pub loss_pct: f64,
    /// Latency jitter in milliseconds.
    pub jitter_ms: f64,
    /// Signal strength in dBm where the class reports one.
    pub signal_dbm: Option<f64>,
    /// Class-specific payload.
    pub extras: ClassExtras,
    /// How the measurements were obtained.
    pub method: CollectionMethod,
    /// Why parts of the sample are missing, when collection degraded.
    pub error: Option<String>,
    /// How long the collection itself took.
    pub collected_in_ms: u64,
}

impl Sample {
    /// Sentinel sample for a member where even the ping fallback failed.
    /// Scores to zero; marks the member unusable for this tick.
    #[must_use]
    pub fn sentinel(
        member: MemberName,
        at_mono: MonoTime,
        at_wall: DateTime<Utc>,
        error: String,
    ) -> Self {
        Self {
            member,
            at_mono,
            at_wall,
            latency_ms: 0.0,
            loss_pct: 100.0,
            jitter_ms: 0.0,
            signal_dbm: None,
            extras: ClassExtras::None,
            method: CollectionMethod::Estimated,
            error: Some(error),
            collected_in_ms: 0,
        }
    }

    /// Whether the collection fully failed. Estimated samples that still
    /// carry real probe data (e.g. counters + ping) are not sentinels.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.error.is_some()
            && self.method == CollectionMethod::Estimated
            && self.loss_pct >= 100.0
    }
}

/// Quality estimate derived from a sample plus history. Higher is better;
/// zero means unusable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Score of the freshest sample alone.
    pub instant: f64,
    /// Exponentially weighted moving average of instant scores.
    pub ewma: f64,
    /// Mean instant score over the configured window.
    pub window_avg: f64,
    /// Blended value the engine compares members by.
    #[serde(rename = "final")]
    pub blended: f64,
}

impl Score {
    /// A score that marks the member unusable.
    #[must_use]
    pub fn unusable() -> Self {
        Self {
            instant: 0.0,
            ewma: 0.0,
            window_avg: 0.0,
            blended: 0.0,
        }
    }
}

/// What caused a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionTrigger {
    /// Score comparison crossed the configured margin.
    Threshold,
    /// A predictive degradation signal forced the comparison.
    Predictive,
    /// Operator action through the RPC surface.
    Manual,
    /// Registry discovery selected the first primary.
    Discovery,
    /// A configuration change required re-selection.
    Config,
}

/// Machine-readable reason classification for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    /// The previous primary became ineligible mid-tick.
    PrimaryIneligible,
    /// A candidate held the margin for the required dwell.
    BetterCandidate,
    /// The obstruction emergency threshold short-circuited hysteresis.
    EmergencyObstruction,
    /// A predictive signal demoted the primary's effective score.
    PredictiveDegradation,
    /// Operator-requested switch.
    ManualAction,
    /// First primary selection after startup or discovery.
    InitialSelection,
    /// Member set or knobs changed under the engine.
    ConfigChange,
}

/// Reason for a decision: enum kind plus free-form detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionReason {
    /// Classification.
    pub kind: ReasonKind,
    /// Human-readable detail for the audit trail.
    pub detail: String,
}

impl DecisionReason {
    /// Builds a reason.
    #[must_use]
    pub fn new(kind: ReasonKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Audit record of one primary-member decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Unique id.
    pub id: Uuid,
    /// Wall-clock emission time.
    pub at_wall: DateTime<Utc>,
    /// Monotonic emission time.
    pub at_mono: MonoTime,
    /// Member that was primary before, if any.
    pub from_member: Option<MemberName>,
    /// Member selected as new primary.
    pub to_member: MemberName,
    /// Why the engine decided.
    pub reason: DecisionReason,
    /// What raised the decision.
    pub trigger: DecisionTrigger,
    /// Scores of every scored member at decision time.
    pub scores: BTreeMap<MemberName, Score>,
    /// Whether the controller applied the decision.
    pub successful: bool,
    /// Controller error, when unsuccessful.
    pub error: Option<String>,
    /// Controller apply duration.
    pub duration_ms: u64,
    /// Whether dry-run suppressed the external application.
    pub dry_run: bool,
}
