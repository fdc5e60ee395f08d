use super::OptionSide;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Build-up reading of one option leg from its price change and change in OI.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSignal {
    /// Price up, OI up.
    #[display("Long Build")]
    LongBuild,
    /// Price down, OI down.
    #[display("Long Unwinding")]
    LongUnwinding,
    /// Price down, OI up.
    #[display("Short Buildup")]
    ShortBuildup,
    /// Price up, OI down.
    #[display("Short Covering")]
    ShortCovering,
    /// Flat price, OI up.
    #[display("Fresh Positions")]
    FreshPositions,
    /// Flat price, OI down.
    #[display("Position Unwinding")]
    PositionUnwinding,
    /// Price moved on flat OI.
    #[display("Mixed Activity")]
    MixedActivity,
    #[default]
    #[display("No Change")]
    NoChange,
}

impl PositionSignal {
    pub fn classify(price_change: f64, chg_oi: f64) -> Self {
        let price = price_change.partial_cmp(&0.0);
        let oi = chg_oi.partial_cmp(&0.0);

        match (price, oi) {
            (Some(Ordering::Equal), Some(Ordering::Equal)) => PositionSignal::NoChange,
            (Some(Ordering::Greater), Some(Ordering::Greater)) => PositionSignal::LongBuild,
            (Some(Ordering::Less), Some(Ordering::Less)) => PositionSignal::LongUnwinding,
            (Some(Ordering::Less), Some(Ordering::Greater)) => PositionSignal::ShortBuildup,
            (Some(Ordering::Greater), Some(Ordering::Less)) => PositionSignal::ShortCovering,
            (_, Some(Ordering::Greater)) => PositionSignal::FreshPositions,
            (_, Some(Ordering::Less)) => PositionSignal::PositionUnwinding,
            _ => PositionSignal::MixedActivity,
        }
    }

    /// Call-side reading that points to a rising underlying.
    pub fn is_bullish_call(&self) -> bool {
        matches!(self, PositionSignal::LongBuild | PositionSignal::ShortCovering)
    }

    pub fn is_bearish_call(&self) -> bool {
        matches!(self, PositionSignal::ShortBuildup | PositionSignal::LongUnwinding)
    }

    /// Put-side readings mirror the call side.
    pub fn is_bullish_put(&self) -> bool {
        self.is_bearish_call()
    }

    pub fn is_bearish_put(&self) -> bool {
        self.is_bullish_call()
    }
}

impl OptionSide {
    /// Last traded price against the previous close, 0 when no close is known.
    pub fn price_change(&self) -> f64 {
        if self.market_data.close_price > 0.0 {
            self.market_data.ltp - self.market_data.close_price
        } else {
            0.0
        }
    }

    pub fn position(&self) -> PositionSignal {
        PositionSignal::classify(self.price_change(), self.chg_oi())
    }
}
