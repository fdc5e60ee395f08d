use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Upper bound of [`BlastSignal::probability`].
pub const MAX_PROBABILITY: f64 = 0.95;

#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[display("UPSIDE")]
    Upside,
    #[display("DOWNSIDE")]
    Downside,
    #[default]
    #[display("NEUTRAL")]
    Neutral,
}

impl Direction {
    pub fn from_score(score: i32) -> Self {
        match score {
            score if score >= 2 => Direction::Upside,
            score if score <= -2 => Direction::Downside,
            _ => Direction::Neutral,
        }
    }
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    #[default]
    #[display("LOW")]
    Low,
    #[display("MEDIUM")]
    Medium,
    #[display("HIGH")]
    High,
    #[display("VERY_HIGH")]
    VeryHigh,
    #[display("CRITICAL")]
    Critical,
}

impl Confidence {
    pub fn classify(probability: f64, trigger_count: usize) -> Self {
        if probability > 0.7 && trigger_count >= 4 {
            Confidence::Critical
        } else if probability > 0.6 && trigger_count >= 3 {
            Confidence::VeryHigh
        } else if probability > 0.4 {
            Confidence::High
        } else if probability > 0.25 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    #[display("LOW")]
    Low,
    #[display("ELEVATED")]
    Elevated,
    #[display("HIGH")]
    High,
    #[display("EXTREME")]
    Extreme,
}

impl RiskLevel {
    pub fn classify(probability: f64) -> Self {
        if probability > 0.75 {
            RiskLevel::Extreme
        } else if probability > 0.6 {
            RiskLevel::High
        } else if probability > 0.4 {
            RiskLevel::Elevated
        } else {
            RiskLevel::Low
        }
    }
}

/// Individual sub-signal values, each in `[0, 1]`.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct SubSignals {
    pub iv: f64,
    pub oi_acceleration: f64,
    pub concentration: f64,
    pub pin_risk: f64,
    pub gex_flip: f64,
    pub gex_extremeness: f64,
}

/// Precursor forecast embedded in every summary row.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct BlastSignal {
    pub probability: f64,
    pub direction: Direction,
    pub direction_score: i32,
    pub confidence: Confidence,
    pub risk_level: RiskLevel,
    pub triggers: Vec<String>,
    pub sub_signals: SubSignals,
    /// Always `None`, no timing model is attempted.
    pub time_to_blast_minutes: Option<u32>,
}
