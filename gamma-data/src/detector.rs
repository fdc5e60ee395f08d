use crate::{
    chain::metrics::ChainMetrics,
    derivative::Derivatives,
    instrument::SymbolClass,
    signal::{BlastSignal, Confidence, Direction, MAX_PROBABILITY, RiskLevel, SubSignals},
    summary::SummaryRow,
};
use itertools::Itertools;

pub const WEIGHT_IV: f64 = 0.25;
pub const WEIGHT_OI_ACCELERATION: f64 = 0.30;
pub const WEIGHT_CONCENTRATION: f64 = 0.20;
pub const WEIGHT_PIN_RISK: f64 = 0.10;
pub const WEIGHT_GEX_FLIP: f64 = 0.10;
pub const WEIGHT_GEX_EXTREMENESS: f64 = 0.05;

/// History length at which [`score`] switches from percentile bands to a z-score.
pub const Z_SCORE_MIN_POINTS: usize = 10;

/// History length at which [`score`] switches from the fixed fallback to percentile bands.
pub const PERCENTILE_MIN_POINTS: usize = 3;

/// Normalisation tier selected by the amount of history available.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Tier {
    ZScore,
    Percentile,
    Fallback,
}

impl Tier {
    pub fn for_len(len: usize) -> Self {
        if len >= Z_SCORE_MIN_POINTS {
            Tier::ZScore
        } else if len >= PERCENTILE_MIN_POINTS {
            Tier::Percentile
        } else {
            Tier::Fallback
        }
    }
}

/// Normalise `current` against `historical`.
///
/// - 10+ points: z-score using population stdev, 0 when stdev is 0.
/// - 3 to 9 points: +1 above the 75th percentile, -1 below the 25th, else 0.
/// - fewer: 1 when `current > fallback`, else 0.
pub fn score(current: f64, historical: &[f64], fallback: f64) -> f64 {
    match Tier::for_len(historical.len()) {
        Tier::ZScore => {
            let n = historical.len() as f64;
            let mean = historical.iter().sum::<f64>() / n;
            let variance = historical.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let stdev = variance.sqrt();
            if stdev > 0.0 {
                (current - mean) / stdev
            } else {
                0.0
            }
        }
        Tier::Percentile => {
            if current > percentile(historical, 75.0) {
                1.0
            } else if current < percentile(historical, 25.0) {
                -1.0
            } else {
                0.0
            }
        }
        Tier::Fallback => {
            if current > fallback {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Linearly interpolated percentile, `p` in `[0, 100]`.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let sorted = values.iter().copied().sorted_by(f64::total_cmp).collect::<Vec<_>>();
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };

    let rank = (p / 100.0).clamp(0.0, 1.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Percent of `values` strictly below `current`.
fn percentile_rank(current: f64, values: &[f64]) -> f64 {
    if values.is_empty() {
        return 50.0;
    }
    let below = values.iter().filter(|value| **value < current).count();
    below as f64 / values.len() as f64 * 100.0
}

/// Per-class thresholds for the fallback tier when history is too short.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FallbackThresholds {
    /// Absolute IV velocity, vol points per time unit.
    pub iv_velocity: f64,
    /// Absolute OI acceleration, contracts per time unit squared.
    pub oi_acceleration: f64,
    pub concentration: f64,
}

impl FallbackThresholds {
    pub fn for_class(class: SymbolClass) -> Self {
        match class {
            SymbolClass::Index => Self {
                iv_velocity: 0.005,
                oi_acceleration: 50.0,
                concentration: 0.25,
            },
            SymbolClass::Equity => Self {
                iv_velocity: 0.3,
                oi_acceleration: 500.0,
                concentration: 0.25,
            },
        }
    }
}

/// Everything the detector reads for one (symbol, expiry) observation.
#[derive(Debug, Copy, Clone)]
pub struct DetectorInput<'a> {
    pub class: SymbolClass,
    pub metrics: &'a ChainMetrics,
    pub derivatives: &'a Derivatives,
    /// Stored rows preceding the observation, timestamp descending.
    pub history: &'a [SummaryRow],
}

/// Evaluate the blast precursor signal.
pub fn detect(input: DetectorInput<'_>) -> BlastSignal {
    let fallbacks = FallbackThresholds::for_class(input.class);
    let mut triggers = Vec::new();

    let iv_history = input
        .history
        .iter()
        .map(|row| row.metrics.atm_iv)
        .collect::<Vec<_>>();
    let acceleration_history = input
        .history
        .iter()
        .map(|row| row.derivatives.oi_acceleration)
        .collect::<Vec<_>>();
    let concentration_history = input
        .history
        .iter()
        .map(|row| row.metrics.gamma_concentration)
        .collect::<Vec<_>>();
    let gex_history = input
        .history
        .iter()
        .map(|row| row.metrics.net_gex)
        .collect::<Vec<_>>();

    let sub_signals = SubSignals {
        iv: iv_signal(
            input.metrics.atm_iv,
            input.derivatives.iv_velocity,
            &iv_history,
            fallbacks.iv_velocity,
            &mut triggers,
        ),
        oi_acceleration: oi_acceleration_signal(
            input.derivatives.oi_acceleration,
            &acceleration_history,
            fallbacks.oi_acceleration,
            &mut triggers,
        ),
        concentration: concentration_signal(
            input.metrics.gamma_concentration,
            &concentration_history,
            fallbacks.concentration,
            &mut triggers,
        ),
        pin_risk: pin_risk_signal(input.metrics.spot_price, input.metrics.atm_strike, &mut triggers),
        gex_flip: gex_flip_signal(
            input.metrics.net_gex,
            gex_history.first().copied(),
            &mut triggers,
        ),
        gex_extremeness: gex_extremeness_signal(input.metrics.net_gex, &gex_history, &mut triggers),
    };

    let probability = probability(&sub_signals);
    let direction_score = direction_score(input.metrics, input.history);

    BlastSignal {
        probability,
        direction: Direction::from_score(direction_score),
        direction_score,
        confidence: Confidence::classify(probability, triggers.len()),
        risk_level: RiskLevel::classify(probability),
        triggers,
        sub_signals,
        time_to_blast_minutes: None,
    }
}

/// Weighted sum of sub-signals bounded to `[0, 0.95]`.
pub fn probability(signals: &SubSignals) -> f64 {
    let weighted = signals.iv * WEIGHT_IV
        + signals.oi_acceleration * WEIGHT_OI_ACCELERATION
        + signals.concentration * WEIGHT_CONCENTRATION
        + signals.pin_risk * WEIGHT_PIN_RISK
        + signals.gex_flip * WEIGHT_GEX_FLIP
        + signals.gex_extremeness * WEIGHT_GEX_EXTREMENESS;

    weighted.clamp(0.0, MAX_PROBABILITY)
}

fn iv_signal(
    current_iv: f64,
    iv_velocity: f64,
    history: &[f64],
    fallback: f64,
    triggers: &mut Vec<String>,
) -> f64 {
    let (value, rising) = match Tier::for_len(history.len()) {
        Tier::ZScore => {
            let z = score(current_iv, history, fallback);
            let value = if z.abs() >= 1.0 {
                (z.abs() / 2.5).min(1.0)
            } else {
                0.0
            };
            (value, z > 0.0)
        }
        Tier::Percentile => {
            let s = score(current_iv, history, fallback);
            (s.abs() * 0.6, s > 0.0)
        }
        Tier::Fallback => (score(iv_velocity.abs(), &[], fallback) * 0.5, iv_velocity > 0.0),
    };

    if value >= 0.5 {
        triggers.push(if rising { "IV Spike" } else { "IV Collapse" }.to_string());
    }
    value
}

fn oi_acceleration_signal(
    acceleration: f64,
    history: &[f64],
    fallback: f64,
    triggers: &mut Vec<String>,
) -> f64 {
    let (value, unwinding) = match Tier::for_len(history.len()) {
        Tier::ZScore => {
            let z = score(acceleration, history, fallback);
            let magnitude = (z.abs() / 2.0).min(1.0);
            if z < 0.0 {
                (magnitude, true)
            } else {
                (magnitude * 0.6, false)
            }
        }
        Tier::Percentile => match score(acceleration, history, fallback) {
            s if s < 0.0 => (1.0, true),
            s if s > 0.0 => (0.5, false),
            _ => (0.0, false),
        },
        Tier::Fallback => {
            let unwinding = acceleration < 0.0;
            let hit = score(acceleration.abs(), &[], fallback);
            (hit * if unwinding { 1.0 } else { 0.6 }, unwinding)
        }
    };

    if value >= 0.5 {
        triggers.push(
            if unwinding {
                "OI Unwinding Acceleration"
            } else {
                "OI Buildup Acceleration"
            }
            .to_string(),
        );
    }
    value
}

fn concentration_signal(
    concentration: f64,
    history: &[f64],
    fallback: f64,
    triggers: &mut Vec<String>,
) -> f64 {
    let value = match Tier::for_len(history.len()) {
        Tier::ZScore => {
            let z = score(concentration, history, fallback);
            if z > 0.0 { (z / 2.0).min(1.0) } else { 0.0 }
        }
        Tier::Percentile => {
            if score(concentration, history, fallback) > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Tier::Fallback => score(concentration, &[], fallback) * 0.7,
    };

    if value >= 0.5 {
        triggers.push("Gamma Concentration Expansion".to_string());
    }
    value
}

fn pin_risk_signal(spot: f64, atm_strike: f64, triggers: &mut Vec<String>) -> f64 {
    if spot <= 0.0 {
        return 0.0;
    }

    let distance_pct = (spot - atm_strike).abs() / spot * 100.0;
    if distance_pct <= 0.2 {
        triggers.push("Pin Risk".to_string());
        1.0
    } else if distance_pct <= 0.5 {
        0.6
    } else if distance_pct <= 1.0 {
        0.3
    } else {
        0.0
    }
}

fn gex_flip_signal(current: f64, previous: Option<f64>, triggers: &mut Vec<String>) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    if current == 0.0 || previous == 0.0 || current.signum() == previous.signum() {
        return 0.0;
    }

    let ratio = current.abs() / previous.abs();
    let (value, trigger) = if ratio >= 0.5 {
        (1.0, "Strong GEX Flip")
    } else if ratio >= 0.2 {
        (0.6, "GEX Flip")
    } else {
        (0.3, "Weak GEX Flip")
    };

    triggers.push(trigger.to_string());
    value
}

fn gex_extremeness_signal(current: f64, history: &[f64], triggers: &mut Vec<String>) -> f64 {
    if history.len() < PERCENTILE_MIN_POINTS {
        return 0.0;
    }

    let rank = percentile_rank(current, history);
    if rank >= 95.0 || rank <= 5.0 {
        triggers.push("Extreme GEX".to_string());
        1.0
    } else if rank >= 90.0 || rank <= 10.0 {
        0.5
    } else {
        0.0
    }
}

/// ITM unwinding magnitudes scaled to the symbol's typical ATM OI.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct UnwindingThresholds {
    pub strong: f64,
    pub mild: f64,
}

impl UnwindingThresholds {
    pub fn from_typical_oi(typical_oi: Option<f64>) -> Self {
        let typical = typical_oi.unwrap_or(0.0);
        Self {
            strong: (typical * 0.10).max(10_000.0),
            mild: (typical * 0.03).max(2_000.0),
        }
    }

    fn unwinding_score(&self, chg_oi: f64) -> i32 {
        if chg_oi >= 0.0 {
            0
        } else if chg_oi.abs() >= self.strong {
            3
        } else if chg_oi.abs() >= self.mild {
            2
        } else {
            0
        }
    }
}

/// Integer direction score. Positive is bullish.
pub fn direction_score(metrics: &ChainMetrics, history: &[SummaryRow]) -> i32 {
    let typical_oi = std::iter::once(metrics.atm_oi)
        .chain(history.iter().map(|row| row.metrics.atm_oi))
        .filter(|oi| *oi > 0.0)
        .collect::<Vec<_>>();
    let typical_oi = (!typical_oi.is_empty())
        .then(|| typical_oi.iter().sum::<f64>() / typical_oi.len() as f64);
    let thresholds = UnwindingThresholds::from_typical_oi(typical_oi);

    // Call writers covering ITM calls is bullish, ITM put unwinding is bearish
    let mut total = thresholds.unwinding_score(metrics.ce_itm_chg_oi)
        - thresholds.unwinding_score(metrics.pe_itm_chg_oi);

    if metrics.pcr_oi > 1.3 {
        total += 1;
    } else if metrics.pcr_oi > 0.0 && metrics.pcr_oi < 0.7 {
        total -= 1;
    }

    let gex_history = history
        .iter()
        .map(|row| row.metrics.net_gex)
        .collect::<Vec<_>>();
    if gex_history.len() >= PERCENTILE_MIN_POINTS {
        if metrics.net_gex < percentile(&gex_history, 25.0) {
            total += 1;
        } else if metrics.net_gex > percentile(&gex_history, 75.0) {
            total -= 1;
        }
    }

    if let (Some(call_iv), Some(put_iv)) = (metrics.avg_call_iv, metrics.avg_put_iv) {
        let skew = call_iv - put_iv;
        if skew > 2.0 {
            total += 1;
        } else if skew < -2.0 {
            total -= 1;
        }
    }

    if let [latest, earlier, ..] = history {
        let points = [
            earlier.metrics.spot_price,
            latest.metrics.spot_price,
            metrics.spot_price,
        ];
        if points.iter().all(|spot| *spot > 0.0) {
            if points[0] < points[1] && points[1] < points[2] {
                total += 1;
            } else if points[0] > points[1] && points[1] > points[2] {
                total -= 1;
            }
        }
    }

    total
}
