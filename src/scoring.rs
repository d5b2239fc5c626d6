//! Score computation: class quality functions, EWMA, blending, obstruction
//! intelligence, and predictive degradation signals
//!
//! Everything here is a pure function of samples plus configuration so the
//! decision engine stays class-agnostic and the math is testable without any
//! I/O. Scores live on a 0..100 scale where higher is better and 0 means
//! unusable.

use crate::config::{ObstructionThresholds, ScoringConfig, StarlinkConfig};
use crate::member::{CellularExtras, ClassExtras, Sample, StarlinkExtras};

/// Consecutive degraded hours recorded before the temporal pattern raises.
const TEMPORAL_PATTERN_MIN_HITS: u32 = 3;

/// Samples the loss-trend slope is computed over. A whole-window slope
/// lingers long after a spike has recovered; the freshest samples are what
/// "rising" means.
const TREND_SAMPLES: usize = 10;

/// Confidence penalty when the class's native API partially failed.
const DEGRADED_PENALTY: f64 = 5.0;
/// Confidence penalty for ping-only collection on a class with a richer
/// native API. Keeps a dish-less Starlink from outranking a healthy backup
/// on ping latency alone.
const PING_FALLBACK_PENALTY: f64 = 15.0;
/// Confidence penalty for counter-estimated collection.
const ESTIMATED_PENALTY: f64 = 25.0;

/// Maps `value` onto 0..100 penalty units against `scale` (the value that
/// costs the full 100).
#[must_use]
pub fn norm(value: f64, scale: f64) -> f64 {
    if scale <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    (value / scale * 100.0).clamp(0.0, 100.0)
}

/// Obstruction classification result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstructionAssessment {
    /// Penalty units (0..100) contributed to the instant score.
    pub penalty_units: f64,
    /// The emergency threshold was crossed; hysteresis is short-circuited.
    pub emergency: bool,
    /// Historical stats corroborate the current obstruction.
    pub corroborated: bool,
}

impl ObstructionAssessment {
    fn clear() -> Self {
        Self {
            penalty_units: 0.0,
            emergency: false,
            corroborated: false,
        }
    }
}

/// Classifies obstruction. Current `fraction_obstructed` alone never marks
/// the member bad: it must be corroborated by historical `time_obstructed`
/// or a prolonged-interval average, behind a data-quality gate. The
/// emergency threshold bypasses corroboration entirely.
#[must_use]
pub fn assess_obstruction(
    extras: &StarlinkExtras,
    thresholds: &ObstructionThresholds,
) -> ObstructionAssessment {
    let Some(fraction) = extras.fraction_obstructed else {
        return ObstructionAssessment::clear();
    };
    if !fraction.is_finite() || fraction <= 0.0 {
        return ObstructionAssessment::clear();
    }

    if fraction > thresholds.current_emergency {
        return ObstructionAssessment {
            penalty_units: 100.0,
            emergency: true,
            corroborated: true,
        };
    }

    let data_ok = extras.valid_s.is_some_and(|v| v >= thresholds.min_valid_s)
        && extras
            .patches_valid
            .is_some_and(|p| p >= thresholds.min_patches);
    let historical_bad = extras
        .time_obstructed
        .is_some_and(|t| t > thresholds.historical);
    let prolonged_bad = extras
        .avg_prolonged_obstruction_s
        .is_some_and(|avg| avg.is_finite() && avg > thresholds.prolonged_s);

    let corroborated =
        fraction > thresholds.current && data_ok && (historical_bad || prolonged_bad);
    if corroborated {
        ObstructionAssessment {
            penalty_units: norm(fraction, thresholds.current_emergency),
            emergency: false,
            corroborated: true,
        }
    } else {
        // Transient sky blockage: a token penalty only.
        ObstructionAssessment {
            penalty_units: (fraction / thresholds.current).clamp(0.0, 1.0) * 10.0,
            emergency: false,
            corroborated: false,
        }
    }
}

fn snr_penalty(extras: &StarlinkExtras, starlink: &StarlinkConfig) -> f64 {
    if extras.snr_persistently_low == Some(true) || extras.snr_above_noise_floor == Some(false) {
        return 100.0;
    }
    match extras.snr {
        Some(snr) if snr < starlink.snr_low_db => {
            ((starlink.snr_low_db - snr) / starlink.snr_low_db * 50.0).clamp(0.0, 50.0)
        }
        _ => 0.0,
    }
}

fn rsrp_penalty(extras: &CellularExtras) -> f64 {
    // -80 dBm or better is clean; -115 dBm costs the full 100 units.
    match extras.rsrp_dbm {
        Some(rsrp) => ((-80.0 - rsrp) / 35.0 * 100.0).clamp(0.0, 100.0),
        None => 0.0,
    }
}

fn technology_bias(extras: &CellularExtras) -> f64 {
    match extras.technology.as_deref() {
        Some(tech) => {
            let tech = tech.to_ascii_uppercase();
            if tech.contains("5G") {
                0.0
            } else if tech.contains("LTE") || tech.contains("4G") {
                10.0
            } else if tech.contains("WCDMA") || tech.contains("UMTS") || tech.contains("3G") {
                50.0
            } else if tech.contains("EDGE") || tech.contains("GPRS") || tech.contains("2G") {
                90.0
            } else {
                20.0
            }
        }
        None => 20.0,
    }
}

/// Class-specific reason a sample is unusable (`instant = 0`), if any.
#[must_use]
pub fn unusable_reason(sample: &Sample, scoring: &ScoringConfig) -> Option<String> {
    if sample.is_sentinel() {
        return Some("collection failed on every path".to_string());
    }
    if sample.loss_pct >= 100.0 {
        return Some("total packet loss".to_string());
    }
    match &sample.extras {
        ClassExtras::Starlink(extras) => {
            if extras.alerts.thermal_shutdown {
                return Some("dish thermal shutdown".to_string());
            }
            None
        }
        ClassExtras::Cellular(extras) => match extras.rsrp_dbm {
            Some(rsrp) if rsrp < scoring.rsrp_unusable_dbm => {
                Some(format!("rsrp {rsrp} dBm below usable floor"))
            }
            _ => None,
        },
        ClassExtras::Wifi(extras) if !extras.station_mode => {
            Some("interface not in station mode".to_string())
        }
        _ => None,
    }
}

/// Instant quality of one sample on the 0..100 scale.
#[must_use]
pub fn instant_score(
    sample: &Sample,
    scoring: &ScoringConfig,
    starlink: &StarlinkConfig,
) -> f64 {
    if unusable_reason(sample, scoring).is_some() {
        return 0.0;
    }

    let confidence_penalty = match sample.method {
        crate::member::CollectionMethod::Primary => 0.0,
        crate::member::CollectionMethod::Degraded => DEGRADED_PENALTY,
        crate::member::CollectionMethod::PingFallback => PING_FALLBACK_PENALTY,
        crate::member::CollectionMethod::Estimated => ESTIMATED_PENALTY,
    };
    // LAN is ping-native; its primary path carries no confidence penalty by
    // construction (the collector tags it Primary).
    let mut score = 100.0
        - confidence_penalty
        - scoring.w_latency * norm(sample.latency_ms, scoring.latency_norm_ms)
        - scoring.w_loss * norm(sample.loss_pct, scoring.loss_norm_pct)
        - scoring.w_jitter * norm(sample.jitter_ms, scoring.jitter_norm_ms);

    match &sample.extras {
        ClassExtras::Starlink(extras) => {
            let obstruction = assess_obstruction(extras, &starlink.obstruction);
            score -= scoring.w_obstruction * obstruction.penalty_units;
            score -= scoring.w_snr * snr_penalty(extras, starlink);
        }
        ClassExtras::Cellular(extras) => {
            score -= scoring.w_rsrp * rsrp_penalty(extras);
            score -= scoring.w_technology * technology_bias(extras);
        }
        ClassExtras::Wifi(_) | ClassExtras::None => {}
    }

    score.clamp(0.0, 100.0)
}

/// Mean instant score across a window of samples. `None` when empty.
#[must_use]
pub fn window_average(
    samples: &[Sample],
    scoring: &ScoringConfig,
    starlink: &StarlinkConfig,
) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples
        .iter()
        .map(|s| instant_score(s, scoring, starlink))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    Some(sum / samples.len() as f64)
}

/// Blends instant, EWMA, and window average with the configured
/// coefficients (validated to sum to 1).
#[must_use]
pub fn blend(instant: f64, ewma: f64, window_avg: f64, scoring: &ScoringConfig) -> f64 {
    (scoring.blend_instant.into_inner() * instant
        + scoring.blend_ewma.into_inner() * ewma
        + scoring.blend_window.into_inner() * window_avg)
        .clamp(0.0, 100.0)
}

/// Per-member EWMA state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreKeeper {
    ewma: Option<f64>,
}

impl ScoreKeeper {
    /// Folds one instant score into the EWMA and returns the new value.
    pub fn update(&mut self, instant: f64, alpha: f64) -> f64 {
        let next = match self.ewma {
            Some(prev) => alpha * instant + (1.0 - alpha) * prev,
            None => instant,
        };
        self.ewma = Some(next);
        next
    }

    /// Current EWMA, falling back to `instant` before the first update.
    #[must_use]
    pub fn current(&self, instant: f64) -> f64 {
        self.ewma.unwrap_or(instant)
    }
}

/// Least-squares slope of loss percentage over time, in pct per second.
/// Zero when fewer than two samples.
#[must_use]
pub fn loss_slope(samples: &[Sample]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let base = samples[0].at_mono;
    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| (s.at_mono.since(base).as_secs_f64(), s.loss_pct))
        .collect();
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

/// Kinds of predictive degradation signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictiveSignalKind {
    /// The dish reports SNR persistently below the noise floor.
    SnrPersistentlyLow,
    /// Loss is trending upward over the window.
    RisingLossTrend,
    /// Thermal throttling is active.
    ThermalThrottle,
    /// A firmware reboot is staged.
    RebootPending,
    /// Degradation has repeatedly occurred at this hour of day.
    TemporalPattern,
}

/// One raised predictive signal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PredictiveSignal {
    /// Signal classification.
    pub kind: PredictiveSignalKind,
    /// Human-readable detail.
    pub detail: String,
}

/// Per-member predictive state: a learned hour-of-day degradation pattern.
///
/// The model is deliberately simple and monotone: hits only accumulate, so a
/// member that repeatedly degrades at the same hour will keep raising the
/// temporal flag at that hour.
#[derive(Debug, Clone, Default)]
pub struct PredictiveState {
    hourly_hits: [u32; 24],
}

impl PredictiveState {
    /// Assesses predictive signals for the freshest sample and its window.
    /// `hour` is the wall-clock hour of day (0..24).
    pub fn assess(
        &mut self,
        sample: &Sample,
        window: &[Sample],
        scoring: &ScoringConfig,
        hour: u32,
    ) -> Vec<PredictiveSignal> {
        let mut signals = Vec::new();

        if let ClassExtras::Starlink(extras) = &sample.extras {
            if extras.snr_persistently_low == Some(true) {
                signals.push(PredictiveSignal {
                    kind: PredictiveSignalKind::SnrPersistentlyLow,
                    detail: "dish reports persistently low SNR".to_string(),
                });
            }
            if extras.alerts.thermal_throttle {
                signals.push(PredictiveSignal {
                    kind: PredictiveSignalKind::ThermalThrottle,
                    detail: "dish is thermally throttling".to_string(),
                });
            }
            if extras.alerts.reboot_ready {
                signals.push(PredictiveSignal {
                    kind: PredictiveSignalKind::RebootPending,
                    detail: "firmware update staged, reboot pending".to_string(),
                });
            }
        }

        let recent = if window.len() > TREND_SAMPLES {
            &window[window.len() - TREND_SAMPLES..]
        } else {
            window
        };
        let slope = loss_slope(recent);
        if slope > scoring.loss_trend_threshold {
            signals.push(PredictiveSignal {
                kind: PredictiveSignalKind::RisingLossTrend,
                detail: format!("loss rising at {slope:.3} pct/s over the window"),
            });
        }

        let hour_idx = (hour % 24) as usize;
        if !signals.is_empty() {
            self.hourly_hits[hour_idx] = self.hourly_hits[hour_idx].saturating_add(1);
        } else if self.hourly_hits[hour_idx] >= TEMPORAL_PATTERN_MIN_HITS && slope > 0.0 {
            signals.push(PredictiveSignal {
                kind: PredictiveSignalKind::TemporalPattern,
                detail: format!(
                    "degradation has recurred {} times at hour {hour_idx}",
                    self.hourly_hits[hour_idx]
                ),
            });
        }

        signals
    }
}
