use crate::{
    chain::{OptionSide, StrikeRecord, buckets::PcrBreakdown, position::PositionSignal},
    signal::Confidence,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};

pub const WEIGHT_PRICE_ACTION: f64 = 0.25;
pub const WEIGHT_OPEN_INTEREST: f64 = 0.30;
pub const WEIGHT_FRESH_ACTIVITY: f64 = 0.25;
pub const WEIGHT_POSITION_DISTRIBUTION: f64 = 0.20;

/// Bound of every component and of the final score.
pub const SCORE_BOUND: f64 = 100.0;

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    #[display("STRONG BEARISH")]
    StrongBearish,
    #[display("BEARISH")]
    Bearish,
    #[display("BEARISH BIAS")]
    BearishBias,
    #[default]
    #[display("NEUTRAL")]
    Neutral,
    #[display("BULLISH BIAS")]
    BullishBias,
    #[display("BULLISH")]
    Bullish,
    #[display("STRONG BULLISH")]
    StrongBullish,
}

impl Sentiment {
    /// Category and confidence of a final score.
    pub fn classify(score: f64) -> (Self, Confidence) {
        match score {
            s if s >= 60.0 => (Sentiment::StrongBullish, Confidence::High),
            s if s >= 30.0 => (Sentiment::Bullish, Confidence::High),
            s if s >= 15.0 => (Sentiment::BullishBias, Confidence::Medium),
            s if s <= -60.0 => (Sentiment::StrongBearish, Confidence::High),
            s if s <= -30.0 => (Sentiment::Bearish, Confidence::High),
            s if s <= -15.0 => (Sentiment::BearishBias, Confidence::Medium),
            _ => (Sentiment::Neutral, Confidence::Medium),
        }
    }
}

/// Individual component scores, each in `[-100, 100]`. Positive is bullish.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct SentimentComponents {
    pub price_action: f64,
    pub open_interest: f64,
    pub fresh_activity: f64,
    pub position_distribution: f64,
}

impl SentimentComponents {
    pub fn weighted(&self) -> f64 {
        self.price_action * WEIGHT_PRICE_ACTION
            + self.open_interest * WEIGHT_OPEN_INTEREST
            + self.fresh_activity * WEIGHT_FRESH_ACTIVITY
            + self.position_distribution * WEIGHT_POSITION_DISTRIBUTION
    }
}

/// Weighted multi-factor market sentiment of one chain observation.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct SentimentScore {
    pub score: f64,
    pub sentiment: Sentiment,
    pub confidence: Confidence,
    pub components: SentimentComponents,
    /// Strike carrying the largest combined call and put OI.
    pub max_pain_strike: Option<f64>,
}

impl SentimentScore {
    /// Score a chain from its strikes, spot and bucketed put/call ratios.
    pub fn compute(strikes: &[StrikeRecord], spot: f64, pcr: &PcrBreakdown) -> Self {
        if strikes.is_empty() {
            return Self::default();
        }

        let max_pain_strike = max_pain_strike(strikes);
        let components = SentimentComponents {
            price_action: price_action_score(strikes, spot, max_pain_strike),
            open_interest: open_interest_score(pcr.oi.overall),
            fresh_activity: fresh_activity_score(pcr.chg_oi.overall),
            position_distribution: position_distribution_score(strikes),
        };

        let score = components.weighted();
        let (sentiment, confidence) = Sentiment::classify(score);

        Self {
            score,
            sentiment,
            confidence,
            components,
            max_pain_strike,
        }
    }
}

fn bounded(score: f64) -> f64 {
    score.clamp(-SCORE_BOUND, SCORE_BOUND)
}

/// First strike with the largest call plus put OI.
fn max_pain_strike(strikes: &[StrikeRecord]) -> Option<f64> {
    strikes
        .iter()
        .fold(None, |best: Option<(f64, f64)>, record| {
            let oi = record.call_oi() + record.put_oi();
            match best {
                Some((_, best_oi)) if best_oi >= oi => best,
                _ => Some((record.strike_price, oi)),
            }
        })
        .map(|(strike, _)| strike)
}

fn price_action_score(strikes: &[StrikeRecord], spot: f64, max_pain: Option<f64>) -> f64 {
    let above = strikes.iter().filter(|record| record.strike_price > spot).count();
    let below = strikes.iter().filter(|record| record.strike_price < spot).count();

    let mut score: f64 = match above.cmp(&below) {
        std::cmp::Ordering::Greater => 20.0,
        std::cmp::Ordering::Less => -20.0,
        std::cmp::Ordering::Equal => 0.0,
    };

    if let Some(max_pain) = max_pain.filter(|strike| *strike > 0.0) {
        let spot_vs_max_pain_pct = (spot - max_pain) / max_pain * 100.0;
        if spot_vs_max_pain_pct > 2.0 {
            score -= 30.0;
        } else if spot_vs_max_pain_pct < -2.0 {
            score += 30.0;
        }
    }

    bounded(score)
}

/// Low put/call OI reads bullish, high reads bearish.
fn open_interest_score(pcr_oi: f64) -> f64 {
    match pcr_oi {
        pcr if pcr < 0.6 => 40.0,
        pcr if pcr < 0.8 => 20.0,
        pcr if pcr > 1.4 => -40.0,
        pcr if pcr > 1.2 => -20.0,
        _ => 0.0,
    }
}

/// Fresh put writing reads bullish, fresh call writing bearish.
fn fresh_activity_score(pcr_chg_oi: f64) -> f64 {
    match pcr_chg_oi {
        pcr if pcr > 2.0 => 50.0,
        pcr if pcr > 1.5 => 30.0,
        pcr if pcr < 0.3 => -50.0,
        pcr if pcr < 0.6 => -30.0,
        _ => 0.0,
    }
}

/// Net bullish leg readings as a share of strikes, scaled by 10.
fn position_distribution_score(strikes: &[StrikeRecord]) -> f64 {
    let calls = strikes
        .iter()
        .filter_map(|record| record.call_options.as_ref())
        .map(OptionSide::position)
        .collect::<Vec<_>>();
    let puts = strikes
        .iter()
        .filter_map(|record| record.put_options.as_ref())
        .map(OptionSide::position)
        .collect::<Vec<_>>();

    let count = |legs: &[PositionSignal], test: fn(&PositionSignal) -> bool| {
        legs.iter().filter(|position| test(position)).count() as f64
    };

    let net = count(&calls, PositionSignal::is_bullish_call)
        - count(&calls, PositionSignal::is_bearish_call)
        + count(&puts, PositionSignal::is_bullish_put)
        - count(&puts, PositionSignal::is_bearish_put);

    bounded(net / strikes.len() as f64 * 100.0 * 10.0)
}
