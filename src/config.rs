//! Validated configuration with atomic hot-reload
//!
//! Configuration arrives as UCI-style sections of string options
//! ([`RawConfig`]), is validated into a typed [`Config`], and is published
//! through an [`ConfigHandle`] backed by an atomic pointer swap. The engine
//! reads one snapshot per tick; a failed validation leaves the running config
//! untouched and reports every offending field at once.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::domain_types::{
    BlendWeight, DishPort, EwmaAlpha, FailThreshold, InterfaceName, MemberName, PollIntervalMs,
    RamBudgetMb, RouteMetric, SwitchMargin, WorkerPoolSize,
};
use crate::member::MemberClass;

/// Default metric for the preferred member. Low wins.
pub const DEFAULT_METRIC_GOOD: u32 = 1;
/// Default fixed metric for demoted members. Assigned as a constant, never
/// derived from a previous metric.
pub const DEFAULT_METRIC_BAD: u32 = 100;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The raw config text could not be parsed.
    #[error("config parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// One or more fields failed validation. The running config is untouched.
    #[error("config validation failed: {}", errors.join("; "))]
    Validation {
        /// `section.key: reason` entries for every offending field.
        errors: Vec<String>,
    },

    /// The key is not part of the recognized vocabulary.
    #[error("unknown config key: {0}")]
    UnknownKey(String),

    /// JSON (de)serialization failed.
    #[error("config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Log verbosity accepted by `main.log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Collector and engine detail.
    Debug,
    /// Default operational logging.
    Info,
    /// Degradations and near-misses.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Parses the config spelling.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// The `tracing` filter directive for this level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// `main` section: loop cadence and hysteresis knobs.
#[derive(Debug, Clone)]
pub struct MainConfig {
    /// Master enable; a disabled daemon still serves status but never switches.
    pub enable: bool,
    /// Log verbosity, live-reloadable.
    pub log_level: LogLevel,
    /// Tick interval.
    pub poll_interval: PollIntervalMs,
    /// Score margin a candidate must hold over the primary.
    pub switch_margin: SwitchMargin,
    /// Consecutive collection failures before a member turns ineligible.
    pub fail_threshold: FailThreshold,
    /// Consecutive failures before a member is marked failed.
    pub hard_fail_threshold: FailThreshold,
    /// How long degradation must persist before a switch.
    pub fail_min_duration: Duration,
    /// Dwell required to restore a preferred-class member.
    pub restore_min_duration: Duration,
    /// Cooldown entered by both sides of a switch.
    pub cooldown: Duration,
    /// Log decisions without touching the routing engine.
    pub dry_run: bool,
    /// Enable predictive triggers.
    pub predictive: bool,
    /// Grace period for in-flight work at shutdown.
    pub shutdown_grace: Duration,
    /// Collector fan-out bound.
    pub worker_pool: WorkerPoolSize,
}

/// `scoring` section: weights, norms, and the blend.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Latency weight.
    pub w_latency: f64,
    /// Loss weight.
    pub w_loss: f64,
    /// Jitter weight.
    pub w_jitter: f64,
    /// Starlink obstruction weight.
    pub w_obstruction: f64,
    /// Starlink SNR weight.
    pub w_snr: f64,
    /// Cellular RSRP weight.
    pub w_rsrp: f64,
    /// Cellular technology bias weight.
    pub w_technology: f64,
    /// Latency mapping to 100 penalty points, milliseconds.
    pub latency_norm_ms: f64,
    /// Jitter mapping to 100 penalty points, milliseconds.
    pub jitter_norm_ms: f64,
    /// Loss mapping to 100 penalty points, percent.
    pub loss_norm_pct: f64,
    /// EWMA smoothing factor.
    pub alpha: EwmaAlpha,
    /// Blend coefficient for the instant score.
    pub blend_instant: BlendWeight,
    /// Blend coefficient for the EWMA.
    pub blend_ewma: BlendWeight,
    /// Blend coefficient for the window average.
    pub blend_window: BlendWeight,
    /// History window for the window average and trend detection.
    pub window: Duration,
    /// Effective score reduction while a predictive flag is raised.
    pub predictive_margin: f64,
    /// RSRP below which a cellular member is unusable, dBm.
    pub rsrp_unusable_dbm: f64,
    /// Loss slope (pct per second) above which the loss trend flag raises.
    pub loss_trend_threshold: f64,
}

/// Obstruction classification thresholds.
#[derive(Debug, Clone)]
pub struct ObstructionThresholds {
    /// Current obstructed-fraction threshold, 0..1.
    pub current: f64,
    /// Emergency obstructed-fraction threshold; short-circuits hysteresis.
    pub current_emergency: f64,
    /// Historical time-obstructed threshold, 0..1.
    pub historical: f64,
    /// Prolonged-interval threshold, seconds.
    pub prolonged_s: f64,
    /// Minimum valid measurement seconds before stats are trusted.
    pub min_valid_s: f64,
    /// Minimum valid patches before stats are trusted.
    pub min_patches: u32,
}

/// `starlink` section.
#[derive(Debug, Clone)]
pub struct StarlinkConfig {
    /// Dish gRPC address.
    pub dish_ip: Ipv4Addr,
    /// Dish gRPC port.
    pub dish_port: DishPort,
    /// Obstruction thresholds.
    pub obstruction: ObstructionThresholds,
    /// SNR below this (dB) counts as low for the SNR penalty.
    pub snr_low_db: f64,
    /// Per-RPC deadline toward the dish.
    pub rpc_timeout: Duration,
    /// Also poll `get_location` (diagnostics aid, off by default).
    pub poll_location: bool,
}

/// `telemetry` section.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Process-wide RAM ceiling for retained samples.
    pub max_ram_mb: RamBudgetMb,
    /// Hi-res retention target.
    pub retention: Duration,
    /// Aggregate bucket interval.
    pub bucket: Duration,
}

/// `notifications` section. Delivery backends are external; these flags and
/// the rate limit gate what the notifier emits.
#[derive(Debug, Clone)]
pub struct NotificationsConfig {
    /// Notify on failover away from the preferred member.
    pub on_failover: bool,
    /// Notify on restoration.
    pub on_restore: bool,
    /// Notify when a member turns ineligible.
    pub on_member_down: bool,
    /// Notify when a member recovers.
    pub on_recovery: bool,
    /// Minimum interval between notifications of the same kind.
    pub rate_limit: Duration,
}

/// One `member_<name>` section.
#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// Member name (the section suffix).
    pub name: MemberName,
    /// Uplink class.
    pub class: MemberClass,
    /// OS interface.
    pub interface: InterfaceName,
    /// Whether the member participates at all.
    pub enabled: bool,
    /// SIM slot for cellular members.
    pub sim_slot: Option<u8>,
    /// Per-member dish endpoint override.
    pub dish_endpoint: Option<String>,
    /// Per-member preferred-slot metric override.
    pub metric_good: Option<RouteMetric>,
    /// Per-member demoted-slot metric override.
    pub metric_bad: Option<RouteMetric>,
    /// Ping anchors for this member's fallback probes.
    pub ping_anchors: Vec<String>,
}

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `main` section.
    pub main: MainConfig,
    /// `scoring` section.
    pub scoring: ScoringConfig,
    /// `starlink` section.
    pub starlink: StarlinkConfig,
    /// `telemetry` section.
    pub telemetry: TelemetryConfig,
    /// `notifications` section.
    pub notifications: NotificationsConfig,
    /// Configured members, ordered by class then name.
    pub members: Vec<MemberConfig>,
}

impl Config {
    /// The member config for `name`, if configured.
    #[must_use]
    pub fn member(&self, name: &MemberName) -> Option<&MemberConfig> {
        self.members.iter().find(|m| &m.name == name)
    }

    /// Effective preferred-slot metric for a member.
    #[must_use]
    pub fn metric_good_for(&self, name: &MemberName) -> RouteMetric {
        self.member(name)
            .and_then(|m| m.metric_good)
            .unwrap_or_else(|| RouteMetric::try_new(DEFAULT_METRIC_GOOD).expect("constant valid"))
    }

    /// Effective demoted-slot metric for a member. Always a constant.
    #[must_use]
    pub fn metric_bad_for(&self, name: &MemberName) -> RouteMetric {
        self.member(name)
            .and_then(|m| m.metric_bad)
            .unwrap_or_else(|| RouteMetric::try_new(DEFAULT_METRIC_BAD).expect("constant valid"))
    }
}

/// UCI-style raw configuration: sections of string options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl RawConfig {
    /// Parses `uci export`-shaped text.
    ///
    /// Recognized lines: `config <type> '<name>'`, `option <key> '<value>'`,
    /// `list <key> '<value>'` (lists join space-separated). Anything else
    /// except blanks and comments is rejected.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` with the offending line number.
    pub fn parse_uci(text: &str) -> Result<Self, ConfigError> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            let lineno = idx + 1;
            if line.is_empty() || line.starts_with('#') || line.starts_with("package ") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("config ") {
                let name = rest
                    .split_whitespace()
                    .last()
                    .map(|token| token.trim_matches('\''))
                    .ok_or_else(|| ConfigError::Parse {
                        line: lineno,
                        reason: "config line without a section".to_string(),
                    })?;
                sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }
            let (key_part, is_list) = if let Some(rest) = line.strip_prefix("option ") {
                (rest, false)
            } else if let Some(rest) = line.strip_prefix("list ") {
                (rest, true)
            } else {
                return Err(ConfigError::Parse {
                    line: lineno,
                    reason: format!("unrecognized line: {line}"),
                });
            };
            let section = current.clone().ok_or_else(|| ConfigError::Parse {
                line: lineno,
                reason: "option outside of a config section".to_string(),
            })?;
            let mut parts = key_part.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default().to_string();
            let value = parts
                .next()
                .map(|v| v.trim().trim_matches('\'').to_string())
                .unwrap_or_default();
            if key.is_empty() {
                return Err(ConfigError::Parse {
                    line: lineno,
                    reason: "option without a key".to_string(),
                });
            }
            let entry = sections.entry(section).or_default();
            if is_list {
                let joined = entry
                    .get(&key)
                    .map(|existing| format!("{existing} {value}"))
                    .unwrap_or_else(|| value.clone());
                entry.insert(key, joined);
            } else {
                entry.insert(key, value);
            }
        }
        Ok(Self { sections })
    }

    /// Parses the JSON shape (`{"section": {"key": "value"}}`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Serialization` on malformed JSON.
    pub fn parse_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Renders the JSON shape for `config.get` exports.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Serialization` when encoding fails.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Option value as stored.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    /// Sets an option value.
    pub fn set(&mut self, section: &str, key: &str, value: String) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Member section names (`member_*`), in order.
    fn member_sections(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.sections
            .iter()
            .filter(|(name, _)| name.starts_with("member_"))
            .map(|(name, options)| (name.as_str(), options))
    }
}

/// Splits a dotted `section.key`, folding documented aliases onto their
/// canonical spelling.
fn canonical_key(key: &str) -> Result<(String, String), ConfigError> {
    let (section, option) = key
        .split_once('.')
        .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
    // Backward compatibility: scoring.switch_threshold is the old spelling
    // of main.switch_margin.
    if section == "scoring" && option == "switch_threshold" {
        return Ok(("main".to_string(), "switch_margin".to_string()));
    }
    Ok((section.to_string(), option.to_string()))
}

/// Value shape of a recognized option, used to canonicalize `config.set`
/// input before storing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Bool,
    U64,
    F64,
    Text,
}

fn known_kind(section: &str, key: &str) -> Option<KeyKind> {
    use KeyKind::{Bool, F64, Text, U64};
    let kind = match (section, key) {
        ("main", "enable" | "dry_run" | "predictive") => Bool,
        (
            "main",
            "poll_interval_ms" | "fail_threshold" | "hard_fail_threshold" | "fail_min_duration_s"
            | "restore_min_duration_s" | "cooldown_seconds" | "shutdown_grace_seconds"
            | "worker_pool_size",
        ) => U64,
        ("main", "switch_margin") => F64,
        ("main", "log_level") => Text,
        ("scoring", "window_seconds") => U64,
        ("scoring", _) => F64,
        ("starlink", "dish_ip") => Text,
        ("starlink", "dish_port" | "rpc_timeout_ms" | "obstruction_min_patches") => U64,
        ("starlink", "poll_location") => Bool,
        ("starlink", _) => F64,
        ("telemetry", "max_ram_mb" | "retention_seconds" | "bucket_seconds") => U64,
        ("notifications", "rate_limit_seconds") => U64,
        ("notifications", _) => Bool,
        _ if section.starts_with("member_") => match key {
            "enabled" => Bool,
            "sim_slot" | "metric_good" | "metric_bad" => U64,
            "class" | "interface" | "dish_endpoint" | "ping_anchors" => Text,
            _ => return None,
        },
        _ => return None,
    };
    Some(kind)
}

/// Canonical rendering of a raw value per its kind; `None` when malformed.
fn canonicalize(kind: KeyKind, value: &str) -> Option<String> {
    match kind {
        KeyKind::Bool => parse_bool(value).map(|b| if b { "1" } else { "0" }.to_string()),
        KeyKind::U64 => value.trim().parse::<u64>().ok().map(|v| v.to_string()),
        KeyKind::F64 => {
            let parsed = value.trim().parse::<f64>().ok()?;
            parsed.is_finite().then(|| format_float(parsed))
        }
        KeyKind::Text => Some(value.trim().to_string()),
    }
}

fn format_float(value: f64) -> String {
    // Shortest round-trip rendering; integral values drop the fraction.
    if (value.fract()).abs() < f64::EPSILON && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Collects `section.key: reason` problems during validation.
#[derive(Debug, Default)]
struct Problems(Vec<String>);

impl Problems {
    fn push(&mut self, section: &str, key: &str, reason: impl std::fmt::Display) {
        self.0.push(format!("{section}.{key}: {reason}"));
    }

    fn into_result(self) -> Result<(), ConfigError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { errors: self.0 })
        }
    }
}

struct SectionReader<'a> {
    raw: &'a RawConfig,
    section: &'a str,
    problems: &'a mut Problems,
}

impl<'a> SectionReader<'a> {
    fn bool(&mut self, key: &str, default: bool) -> bool {
        match self.raw.get(self.section, key) {
            None => default,
            Some(value) => parse_bool(value).unwrap_or_else(|| {
                self.problems.push(self.section, key, "expected 0 or 1");
                default
            }),
        }
    }

    fn u64(&mut self, key: &str, default: u64) -> u64 {
        match self.raw.get(self.section, key) {
            None => default,
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                self.problems.push(self.section, key, "expected an integer");
                default
            }),
        }
    }

    fn f64(&mut self, key: &str, default: f64) -> f64 {
        match self.raw.get(self.section, key) {
            None => default,
            Some(value) => match value.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    self.problems.push(self.section, key, "expected a finite number");
                    default
                }
            },
        }
    }

    fn secs(&mut self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.u64(key, default))
    }
}

impl Config {
    /// Builds and validates a typed config from raw sections.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` listing every offending field.
    pub fn from_raw(raw: &RawConfig) -> Result<Self, ConfigError> {
        let mut problems = Problems::default();

        let main = Self::read_main(raw, &mut problems);
        let scoring = Self::read_scoring(raw, &mut problems);
        let starlink = Self::read_starlink(raw, &mut problems);
        let telemetry = Self::read_telemetry(raw, &mut problems);
        let notifications = Self::read_notifications(raw, &mut problems);
        let members = Self::read_members(raw, &mut problems);

        // Cross-field constraints.
        let blend_sum = scoring.blend_instant.into_inner()
            + scoring.blend_ewma.into_inner()
            + scoring.blend_window.into_inner();
        if (blend_sum - 1.0).abs() > 1e-6 {
            problems.push(
                "scoring",
                "blend_instant",
                format!("blend coefficients must sum to 1, got {blend_sum}"),
            );
        }
        if starlink.obstruction.current_emergency <= starlink.obstruction.current {
            problems.push(
                "starlink",
                "obstruction_current_emergency",
                "must exceed obstruction_current",
            );
        }
        if main.hard_fail_threshold < main.fail_threshold {
            problems.push(
                "main",
                "hard_fail_threshold",
                "must be >= fail_threshold",
            );
        }
        for member in &members {
            if let (Some(good), Some(bad)) = (member.metric_good, member.metric_bad) {
                if good >= bad {
                    problems.push(
                        &format!("member_{}", member.name),
                        "metric_good",
                        "must be lower (more preferred) than metric_bad",
                    );
                }
            }
        }

        problems.into_result()?;
        Ok(Self {
            main,
            scoring,
            starlink,
            telemetry,
            notifications,
            members,
        })
    }

    fn read_main(raw: &RawConfig, problems: &mut Problems) -> MainConfig {
        let mut r = SectionReader { raw, section: "main", problems: &mut *problems };
        let enable = r.bool("enable", true);
        let log_level_raw = raw.get("main", "log_level").unwrap_or("info").to_string();
        let poll_interval_ms = r.u64("poll_interval_ms", 1000);
        let switch_margin = r.f64("switch_margin", 10.0);
        let fail_threshold = r.u64("fail_threshold", 3);
        let hard_fail_threshold = r.u64("hard_fail_threshold", 10);
        let fail_min_duration = r.secs("fail_min_duration_s", 20);
        let restore_min_duration = r.secs("restore_min_duration_s", 300);
        let cooldown = r.secs("cooldown_seconds", 60);
        let dry_run = r.bool("dry_run", false);
        let predictive = r.bool("predictive", true);
        let shutdown_grace = r.secs("shutdown_grace_seconds", 10);
        let worker_pool_size = r.u64("worker_pool_size", 8);

        let log_level = LogLevel::parse(&log_level_raw).unwrap_or_else(|| {
            problems.push("main", "log_level", "expected trace|debug|info|warn|error");
            LogLevel::Info
        });
        let poll_interval = PollIntervalMs::try_new(poll_interval_ms).unwrap_or_else(|e| {
            problems.push("main", "poll_interval_ms", e);
            PollIntervalMs::try_new(1000).expect("default valid")
        });
        let switch_margin = SwitchMargin::try_new(switch_margin).unwrap_or_else(|e| {
            problems.push("main", "switch_margin", e);
            SwitchMargin::try_new(10.0).expect("default valid")
        });
        let fail_threshold = FailThreshold::try_new(u32::try_from(fail_threshold).unwrap_or(0))
            .unwrap_or_else(|e| {
                problems.push("main", "fail_threshold", e);
                FailThreshold::try_new(3).expect("default valid")
            });
        let hard_fail_threshold =
            FailThreshold::try_new(u32::try_from(hard_fail_threshold).unwrap_or(0))
                .unwrap_or_else(|e| {
                    problems.push("main", "hard_fail_threshold", e);
                    FailThreshold::try_new(10).expect("default valid")
                });
        let worker_pool = WorkerPoolSize::try_new(usize::try_from(worker_pool_size).unwrap_or(0))
            .unwrap_or_else(|e| {
                problems.push("main", "worker_pool_size", e);
                WorkerPoolSize::try_new(8).expect("default valid")
            });

        MainConfig {
            enable,
            log_level,
            poll_interval,
            switch_margin,
            fail_threshold,
            hard_fail_threshold,
            fail_min_duration,
            restore_min_duration,
            cooldown,
            dry_run,
            predictive,
            shutdown_grace,
            worker_pool,
        }
    }

    fn read_scoring(raw: &RawConfig, problems: &mut Problems) -> ScoringConfig {
        let mut r = SectionReader { raw, section: "scoring", problems: &mut *problems };
        let w_latency = r.f64("w_latency", 1.0);
        let w_loss = r.f64("w_loss", 2.0);
        let w_jitter = r.f64("w_jitter", 0.5);
        let w_obstruction = r.f64("w_obstruction", 1.0);
        let w_snr = r.f64("w_snr", 1.0);
        let w_rsrp = r.f64("w_rsrp", 1.0);
        let w_technology = r.f64("w_technology", 0.5);
        let latency_norm_ms = r.f64("latency_norm_ms", 400.0);
        let jitter_norm_ms = r.f64("jitter_norm_ms", 100.0);
        let loss_norm_pct = r.f64("loss_norm_pct", 10.0);
        let alpha_raw = r.f64("ewma_alpha", 0.3);
        let blend_instant_raw = r.f64("blend_instant", 0.5);
        let blend_ewma_raw = r.f64("blend_ewma", 0.3);
        let blend_window_raw = r.f64("blend_window", 0.2);
        let window = r.secs("window_seconds", 300);
        let predictive_margin = r.f64("predictive_margin", 15.0);
        let rsrp_unusable_dbm = r.f64("rsrp_unusable_dbm", -120.0);
        let loss_trend_threshold = r.f64("loss_trend_threshold", 0.05);

        let alpha = EwmaAlpha::try_new(alpha_raw).unwrap_or_else(|e| {
            problems.push("scoring", "ewma_alpha", e);
            EwmaAlpha::try_new(0.3).expect("default valid")
        });
        let blend = |problems: &mut Problems, key: &str, value: f64, default: f64| {
            BlendWeight::try_new(value).unwrap_or_else(|e| {
                problems.push("scoring", key, e);
                BlendWeight::try_new(default).expect("default valid")
            })
        };
        let blend_instant = blend(problems, "blend_instant", blend_instant_raw, 0.5);
        let blend_ewma = blend(problems, "blend_ewma", blend_ewma_raw, 0.3);
        let blend_window = blend(problems, "blend_window", blend_window_raw, 0.2);

        ScoringConfig {
            w_latency,
            w_loss,
            w_jitter,
            w_obstruction,
            w_snr,
            w_rsrp,
            w_technology,
            latency_norm_ms,
            jitter_norm_ms,
            loss_norm_pct,
            alpha,
            blend_instant,
            blend_ewma,
            blend_window,
            window,
            predictive_margin,
            rsrp_unusable_dbm,
            loss_trend_threshold,
        }
    }

    fn read_starlink(raw: &RawConfig, problems: &mut Problems) -> StarlinkConfig {
        let mut r = SectionReader { raw, section: "starlink", problems: &mut *problems };
        let dish_ip_raw = raw.get("starlink", "dish_ip").unwrap_or("192.168.100.1").to_string();
        let dish_port_raw = r.u64("dish_port", 9200);
        let current = r.f64("obstruction_current", 0.02);
        let current_emergency = r.f64("obstruction_current_emergency", 0.06);
        let historical = r.f64("obstruction_historical", 0.005);
        let prolonged_s = r.f64("obstruction_prolonged_s", 30.0);
        let min_valid_s = r.f64("obstruction_min_valid_s", 3600.0);
        let min_patches = r.u64("obstruction_min_patches", 1000);
        let snr_low_db = r.f64("snr_low_db", 4.0);
        let rpc_timeout_ms = r.u64("rpc_timeout_ms", 2000);
        let poll_location = r.bool("poll_location", false);

        let dish_ip = dish_ip_raw.parse::<Ipv4Addr>().unwrap_or_else(|_| {
            problems.push("starlink", "dish_ip", "expected an IPv4 address");
            Ipv4Addr::new(192, 168, 100, 1)
        });
        let dish_port = u16::try_from(dish_port_raw)
            .ok()
            .and_then(|p| DishPort::try_new(p).ok())
            .unwrap_or_else(|| {
                problems.push("starlink", "dish_port", "expected a port in 1..65535");
                DishPort::try_new(9200).expect("default valid")
            });

        StarlinkConfig {
            dish_ip,
            dish_port,
            obstruction: ObstructionThresholds {
                current,
                current_emergency,
                historical,
                prolonged_s,
                min_valid_s,
                min_patches: u32::try_from(min_patches).unwrap_or(u32::MAX),
            },
            snr_low_db,
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
            poll_location,
        }
    }

    fn read_telemetry(raw: &RawConfig, problems: &mut Problems) -> TelemetryConfig {
        let mut r = SectionReader { raw, section: "telemetry", problems: &mut *problems };
        let max_ram_mb_raw = r.u64("max_ram_mb", 16);
        let retention = r.secs("retention_seconds", 600);
        let bucket = r.secs("bucket_seconds", 300);
        let max_ram_mb = RamBudgetMb::try_new(max_ram_mb_raw).unwrap_or_else(|e| {
            problems.push("telemetry", "max_ram_mb", e);
            RamBudgetMb::try_new(16).expect("default valid")
        });
        TelemetryConfig {
            max_ram_mb,
            retention,
            bucket,
        }
    }

    fn read_notifications(raw: &RawConfig, problems: &mut Problems) -> NotificationsConfig {
        let mut r = SectionReader { raw, section: "notifications", problems: &mut *problems };
        NotificationsConfig {
            on_failover: r.bool("on_failover", true),
            on_restore: r.bool("on_restore", true),
            on_member_down: r.bool("on_member_down", true),
            on_recovery: r.bool("on_recovery", true),
            rate_limit: r.secs("rate_limit_seconds", 300),
        }
    }

    fn read_members(raw: &RawConfig, problems: &mut Problems) -> Vec<MemberConfig> {
        let mut members = Vec::new();
        for (section, options) in raw.member_sections() {
            let suffix = section.trim_start_matches("member_");
            let Ok(name) = MemberName::try_new(suffix.to_string()) else {
                problems.push(section, "name", "invalid member name");
                continue;
            };
            let Some(class) = options.get("class").and_then(|c| MemberClass::parse(c)) else {
                problems.push(section, "class", "expected starlink|cellular|wifi|lan");
                continue;
            };
            let Some(interface) = options
                .get("interface")
                .and_then(|i| InterfaceName::try_new(i.clone()).ok())
            else {
                problems.push(section, "interface", "required");
                continue;
            };
            let enabled = options
                .get("enabled")
                .map_or(true, |v| parse_bool(v).unwrap_or(true));
            let sim_slot = options.get("sim_slot").and_then(|v| v.parse().ok());
            let dish_endpoint = options.get("dish_endpoint").cloned();
            let metric = |key: &str, problems: &mut Problems| -> Option<RouteMetric> {
                options.get(key).and_then(|v| {
                    v.parse::<u32>()
                        .ok()
                        .and_then(|m| RouteMetric::try_new(m).ok())
                        .or_else(|| {
                            problems.push(section, key, "expected a metric in 1..10000");
                            None
                        })
                })
            };
            let metric_good = metric("metric_good", problems);
            let metric_bad = metric("metric_bad", problems);
            let ping_anchors = options
                .get("ping_anchors")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| {
                    vec![
                        "1.1.1.1".to_string(),
                        "8.8.8.8".to_string(),
                        "9.9.9.9".to_string(),
                    ]
                });

            members.push(MemberConfig {
                name,
                class,
                interface,
                enabled,
                sim_slot,
                dish_endpoint,
                metric_good,
                metric_bad,
                ping_anchors,
            });
        }
        members.sort_by(|a, b| a.class.cmp(&b.class).then_with(|| a.name.cmp(&b.name)));
        members
    }
}

/// Outcome of a `config.set` or full reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The new snapshot is live; the engine picks it up next tick.
    Applied,
    /// The member set changed; the registry must reconcile before the
    /// change fully takes effect.
    NeedsReconcile,
}

/// Live configuration handle: raw sections plus the validated snapshot,
/// atomically swappable.
#[derive(Debug)]
pub struct ConfigHandle {
    raw: Mutex<RawConfig>,
    current: ArcSwap<Config>,
}

impl ConfigHandle {
    /// Validates `raw` and creates the handle.
    ///
    /// # Errors
    ///
    /// Returns the validation error when `raw` does not produce a valid
    /// config.
    pub fn new(raw: RawConfig) -> Result<Self, ConfigError> {
        let config = Config::from_raw(&raw)?;
        Ok(Self {
            raw: Mutex::new(raw),
            current: ArcSwap::from_pointee(config),
        })
    }

    /// The current validated snapshot. Cheap; the engine calls this once per
    /// tick.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Canonicalized value of a dotted key, from the raw sections with
    /// defaults filled by the validated snapshot semantics.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownKey` for keys outside the vocabulary.
    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let (section, option) = canonical_key(key)?;
        let kind =
            known_kind(&section, &option).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let raw = self.raw.lock();
        Ok(raw
            .get(&section, &option)
            .and_then(|value| canonicalize(kind, value)))
    }

    /// Validates and applies one key change. On success the new snapshot is
    /// live; on failure the running config is untouched.
    ///
    /// # Errors
    ///
    /// `UnknownKey` for unrecognized keys, `Validation` when the resulting
    /// config is invalid.
    pub fn set(&self, key: &str, value: &str) -> Result<SetOutcome, ConfigError> {
        let (section, option) = canonical_key(key)?;
        let kind =
            known_kind(&section, &option).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let canonical = canonicalize(kind, value).ok_or_else(|| ConfigError::Validation {
            errors: vec![format!("{section}.{option}: malformed value {value:?}")],
        })?;

        let mut raw = self.raw.lock();
        let mut candidate = raw.clone();
        candidate.set(&section, &option, canonical);
        let config = Config::from_raw(&candidate)?;

        *raw = candidate;
        self.current.store(Arc::new(config));
        info!(key = %key, "config key applied");
        Ok(if section.starts_with("member_") {
            SetOutcome::NeedsReconcile
        } else {
            SetOutcome::Applied
        })
    }

    /// Full reload from a new raw config (file watch or bus reload).
    ///
    /// # Errors
    ///
    /// Returns the validation error; the running config stays live.
    pub fn replace(&self, new_raw: RawConfig) -> Result<SetOutcome, ConfigError> {
        let config = Config::from_raw(&new_raw)?;
        let mut raw = self.raw.lock();
        let members_changed = {
            let old_members: Vec<_> = raw.member_sections().map(|(n, o)| (n.to_string(), o.clone())).collect();
            let new_members: Vec<_> = new_raw.member_sections().map(|(n, o)| (n.to_string(), o.clone())).collect();
            old_members != new_members
        };
        *raw = new_raw;
        self.current.store(Arc::new(config));
        info!("config reloaded");
        Ok(if members_changed {
            SetOutcome::NeedsReconcile
        } else {
            SetOutcome::Applied
        })
    }

    /// JSON export of the raw sections, optionally one member's view.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` when encoding fails.
    pub fn export(&self) -> Result<String, ConfigError> {
        self.raw.lock().to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_UCI: &str = r"
config starfail 'main'
	option poll_interval_ms '1000'
	option switch_margin '10'
	option fail_min_duration_s '20'
	option cooldown_seconds '60'

config starfail 'scoring'
	option ewma_alpha '0.3'

config member 'member_starlink_any'
	option class 'starlink'
	option interface 'wan'

config member 'member_cellular_sim1'
	option class 'cellular'
	option interface 'wwan0'
	option sim_slot '1'
	list ping_anchors '1.1.1.1'
	list ping_anchors '9.9.9.9'
";

    #[test]
    fn test_parse_uci_sections_and_lists() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        assert_eq!(raw.get("main", "poll_interval_ms"), Some("1000"));
        assert_eq!(
            raw.get("member_cellular_sim1", "ping_anchors"),
            Some("1.1.1.1 9.9.9.9")
        );
    }

    #[test]
    fn test_config_builds_with_defaults() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        let config = Config::from_raw(&raw).unwrap();
        assert_eq!(config.main.poll_interval.into_inner(), 1000);
        assert_eq!(config.members.len(), 2);
        // Members ordered by class then name.
        assert_eq!(config.members[0].class, MemberClass::Starlink);
        assert_eq!(config.members[1].sim_slot, Some(1));
        assert_eq!(config.telemetry.max_ram_mb.into_inner(), 16);
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        raw.set("main", "poll_interval_ms", "50".to_string());
        raw.set("main", "switch_margin", "250".to_string());
        let err = Config::from_raw(&raw).unwrap_err();
        match err {
            ConfigError::Validation { errors } => {
                assert!(errors.len() >= 2, "both fields reported: {errors:?}");
            }
            other => panic!("expected Validation, got {other}"),
        }
    }

    #[test]
    fn test_blend_must_sum_to_one() {
        let mut raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        raw.set("scoring", "blend_instant", "0.9".to_string());
        raw.set("scoring", "blend_ewma", "0.9".to_string());
        raw.set("scoring", "blend_window", "0.2".to_string());
        assert!(Config::from_raw(&raw).is_err());
    }

    #[test]
    fn test_set_get_round_trip_is_identity() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        let handle = ConfigHandle::new(raw).unwrap();

        handle.set("main.switch_margin", "12.5").unwrap();
        assert_eq!(handle.get("main.switch_margin").unwrap().unwrap(), "12.5");

        // Booleans canonicalize to 0/1.
        handle.set("main.dry_run", "true").unwrap();
        assert_eq!(handle.get("main.dry_run").unwrap().unwrap(), "1");

        // Integral floats canonicalize without a fraction.
        handle.set("main.switch_margin", "2.0").unwrap();
        assert_eq!(handle.get("main.switch_margin").unwrap().unwrap(), "2");
    }

    #[test]
    fn test_switch_threshold_alias_folds_to_switch_margin() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        let handle = ConfigHandle::new(raw).unwrap();
        handle.set("scoring.switch_threshold", "5").unwrap();
        assert_eq!(handle.get("main.switch_margin").unwrap().unwrap(), "5");
        assert_eq!(handle.snapshot().main.switch_margin.into_inner(), 5.0);
    }

    #[test]
    fn test_failed_set_leaves_running_config_untouched() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        let handle = ConfigHandle::new(raw).unwrap();
        let before = handle.snapshot();

        let err = handle.set("main.poll_interval_ms", "10").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        let after = handle.snapshot();
        assert_eq!(
            before.main.poll_interval.into_inner(),
            after.main.poll_interval.into_inner()
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        let handle = ConfigHandle::new(raw).unwrap();
        assert!(matches!(
            handle.set("main.bogus", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            handle.get("nonsense"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_member_set_change_needs_reconcile() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        let handle = ConfigHandle::new(raw).unwrap();
        let outcome = handle.set("member_starlink_any.enabled", "0").unwrap();
        assert_eq!(outcome, SetOutcome::NeedsReconcile);
        let outcome = handle.set("main.switch_margin", "8").unwrap();
        assert_eq!(outcome, SetOutcome::Applied);
    }

    #[test]
    fn test_emergency_threshold_must_exceed_current() {
        let mut raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        raw.set("starlink", "obstruction_current", "0.06".to_string());
        raw.set("starlink", "obstruction_current_emergency", "0.05".to_string());
        assert!(Config::from_raw(&raw).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let raw = RawConfig::parse_uci(SAMPLE_UCI).unwrap();
        let json = raw.to_json().unwrap();
        let back = RawConfig::parse_json(&json).unwrap();
        assert_eq!(raw, back);
    }
}
