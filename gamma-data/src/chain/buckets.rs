use super::{OptionSide, StrikeRecord};
use serde::{Deserialize, Serialize};

/// Aggregate of the option legs falling in one moneyness bucket.
///
/// Greeks are OI-weighted. A bucket without open interest reports all zeros.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct BucketTotals {
    pub oi: f64,
    pub chg_oi: f64,
    pub volume: f64,
    /// Plain mean of leg IV.
    pub iv: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

impl BucketTotals {
    pub fn aggregate<'a>(legs: impl IntoIterator<Item = &'a OptionSide>) -> Self {
        let legs = legs.into_iter().collect::<Vec<_>>();
        let oi = legs.iter().map(|leg| leg.market_data.oi).sum::<f64>();
        if oi == 0.0 {
            return Self::default();
        }

        let weighted = |greek: fn(&OptionSide) -> f64| {
            legs.iter()
                .map(|leg| greek(leg) * leg.market_data.oi)
                .sum::<f64>()
                / oi
        };

        Self {
            oi,
            chg_oi: legs.iter().map(|leg| leg.chg_oi()).sum(),
            volume: legs.iter().map(|leg| leg.market_data.volume).sum(),
            iv: legs.iter().map(|leg| leg.option_greeks.iv).sum::<f64>() / legs.len() as f64,
            delta: weighted(|leg| leg.option_greeks.delta),
            gamma: weighted(|leg| leg.option_greeks.gamma),
            theta: weighted(|leg| leg.option_greeks.theta),
            vega: weighted(|leg| leg.option_greeks.vega),
        }
    }
}

/// Call and put legs split around the ATM strike. The ATM strike belongs to no bucket.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Buckets {
    /// Calls struck below ATM.
    pub ce_itm: BucketTotals,
    pub ce_otm: BucketTotals,
    /// Puts struck above ATM.
    pub pe_itm: BucketTotals,
    pub pe_otm: BucketTotals,
}

impl Buckets {
    pub fn split(strikes: &[StrikeRecord], atm_strike: f64) -> Self {
        let calls = |keep: fn(f64, f64) -> bool| {
            BucketTotals::aggregate(
                strikes
                    .iter()
                    .filter(|record| keep(record.strike_price, atm_strike))
                    .filter_map(|record| record.call_options.as_ref()),
            )
        };
        let puts = |keep: fn(f64, f64) -> bool| {
            BucketTotals::aggregate(
                strikes
                    .iter()
                    .filter(|record| keep(record.strike_price, atm_strike))
                    .filter_map(|record| record.put_options.as_ref()),
            )
        };

        Self {
            ce_itm: calls(|strike, atm| strike < atm),
            ce_otm: calls(|strike, atm| strike > atm),
            pe_itm: puts(|strike, atm| strike > atm),
            pe_otm: puts(|strike, atm| strike < atm),
        }
    }
}

/// Put/call ratios of one quantity over ITM, OTM and all bucketed legs.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct PcrSet {
    pub itm: f64,
    pub otm: f64,
    pub overall: f64,
}

impl PcrSet {
    fn new(buckets: &Buckets, quantity: fn(&BucketTotals) -> f64) -> Self {
        Self {
            itm: ratio(quantity(&buckets.pe_itm), quantity(&buckets.ce_itm)),
            otm: ratio(quantity(&buckets.pe_otm), quantity(&buckets.ce_otm)),
            overall: ratio(
                quantity(&buckets.pe_itm) + quantity(&buckets.pe_otm),
                quantity(&buckets.ce_itm) + quantity(&buckets.ce_otm),
            ),
        }
    }
}

/// Bucketed put/call ratios by open interest, change in OI and volume.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct PcrBreakdown {
    pub oi: PcrSet,
    pub chg_oi: PcrSet,
    pub volume: PcrSet,
}

impl From<&Buckets> for PcrBreakdown {
    fn from(buckets: &Buckets) -> Self {
        Self {
            oi: PcrSet::new(buckets, |totals| totals.oi),
            chg_oi: PcrSet::new(buckets, |totals| totals.chg_oi),
            volume: PcrSet::new(buckets, |totals| totals.volume),
        }
    }
}

/// `put / call`, 0 when the call side is 0.
fn ratio(put: f64, call: f64) -> f64 {
    if call != 0.0 { put / call } else { 0.0 }
}
