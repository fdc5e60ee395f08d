use super::{
    ChainSnapshot, StrikeRecord,
    buckets::{Buckets, PcrBreakdown},
};
use serde::{Deserialize, Serialize};

/// Contract multiplier used when scaling gamma into exposure.
const GEX_CONTRACT_MULTIPLIER: f64 = 100.0;

/// Exposure quoted per 1% spot move.
const GEX_PERCENT_SCALE: f64 = 0.01;

/// Dealer gamma exposure at a single strike.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct StrikeGex {
    pub strike: f64,
    pub call_gex: f64,
    pub put_gex: f64,
}

impl StrikeGex {
    pub fn net(&self) -> f64 {
        self.call_gex + self.put_gex
    }
}

/// Scalar metrics of a single chain observation, the raw input to the derivative engine
/// and the detector.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct ChainMetrics {
    pub spot_price: f64,
    pub atm_strike: f64,
    /// Mean of the non-zero call and put IV at the ATM strike.
    pub atm_iv: f64,
    /// Call plus put open interest at the ATM strike.
    pub atm_oi: f64,
    pub net_gex: f64,
    pub total_positive_gex: f64,
    pub total_negative_gex: f64,
    pub zero_gamma_level: Option<f64>,
    pub atm_gex: f64,
    /// Share of absolute gamma exposure sitting at the ATM strike, in [0, 1].
    pub gamma_concentration: f64,
    pub pcr_oi: f64,
    pub avg_call_iv: Option<f64>,
    pub avg_put_iv: Option<f64>,
    /// Change in OI summed over in-the-money calls (strike below spot).
    pub ce_itm_chg_oi: f64,
    /// Change in OI summed over in-the-money puts (strike above spot).
    pub pe_itm_chg_oi: f64,
    /// Put/call ratios over the legs on either side of the ATM strike.
    pub pcr: PcrBreakdown,
}

/// Gamma exposure of one option leg, `gamma × OI × 100 × spot² × 0.01`.
pub fn leg_gex(gamma: f64, oi: f64, spot: f64) -> f64 {
    gamma * oi * GEX_CONTRACT_MULTIPLIER * spot.powi(2) * GEX_PERCENT_SCALE
}

/// Per-strike exposure with calls positive and puts negative.
pub fn strike_gex(strikes: &[StrikeRecord], spot: f64) -> Vec<StrikeGex> {
    strikes
        .iter()
        .map(|record| {
            let call_gex = record.call_options.as_ref().map_or(0.0, |side| {
                leg_gex(side.option_greeks.gamma, side.market_data.oi, spot)
            });
            let put_gex = record.put_options.as_ref().map_or(0.0, |side| {
                -leg_gex(side.option_greeks.gamma, side.market_data.oi, spot)
            });

            StrikeGex {
                strike: record.strike_price,
                call_gex,
                put_gex,
            }
        })
        .collect()
}

impl ChainMetrics {
    pub fn from_snapshot(snapshot: &ChainSnapshot) -> Self {
        Self::compute(&snapshot.strikes, snapshot.spot_price)
    }

    pub fn compute(strikes: &[StrikeRecord], spot: f64) -> Self {
        let Some(atm) = strikes.iter().min_by(|a, b| {
            (a.strike_price - spot)
                .abs()
                .total_cmp(&(b.strike_price - spot).abs())
        }) else {
            return Self {
                spot_price: spot,
                ..Self::default()
            };
        };

        let atm_ivs = [&atm.call_options, &atm.put_options]
            .into_iter()
            .flatten()
            .map(|side| side.option_greeks.iv)
            .filter(|iv| *iv > 0.0)
            .collect::<Vec<_>>();
        let atm_iv = mean(&atm_ivs).unwrap_or(0.0);

        let gex = strike_gex(strikes, spot);
        let net_gex = gex.iter().map(StrikeGex::net).sum::<f64>();
        let total_positive_gex = gex.iter().map(StrikeGex::net).filter(|v| *v > 0.0).sum();
        let total_negative_gex = gex
            .iter()
            .map(StrikeGex::net)
            .filter(|v| *v < 0.0)
            .sum::<f64>()
            .abs();
        let zero_gamma_level = gex
            .iter()
            .min_by(|a, b| a.net().abs().total_cmp(&b.net().abs()))
            .map(|level| level.strike);
        let atm_gex = gex
            .iter()
            .find(|level| level.strike == atm.strike_price)
            .map_or(0.0, StrikeGex::net);
        let total_abs_gex = gex.iter().map(|level| level.net().abs()).sum::<f64>();
        let gamma_concentration = if total_abs_gex > 0.0 {
            atm_gex.abs() / total_abs_gex
        } else {
            0.0
        };

        let total_call_oi = strikes.iter().map(StrikeRecord::call_oi).sum::<f64>();
        let total_put_oi = strikes.iter().map(StrikeRecord::put_oi).sum::<f64>();
        let pcr_oi = if total_call_oi > 0.0 {
            total_put_oi / total_call_oi
        } else {
            0.0
        };

        let call_ivs = strikes
            .iter()
            .filter_map(|record| record.call_options.as_ref())
            .map(|side| side.option_greeks.iv)
            .filter(|iv| *iv > 0.0)
            .collect::<Vec<_>>();
        let put_ivs = strikes
            .iter()
            .filter_map(|record| record.put_options.as_ref())
            .map(|side| side.option_greeks.iv)
            .filter(|iv| *iv > 0.0)
            .collect::<Vec<_>>();

        let ce_itm_chg_oi = strikes
            .iter()
            .filter(|record| record.strike_price < spot)
            .filter_map(|record| record.call_options.as_ref())
            .map(|side| side.chg_oi())
            .sum();
        let pe_itm_chg_oi = strikes
            .iter()
            .filter(|record| record.strike_price > spot)
            .filter_map(|record| record.put_options.as_ref())
            .map(|side| side.chg_oi())
            .sum();

        Self {
            spot_price: spot,
            atm_strike: atm.strike_price,
            atm_iv,
            atm_oi: atm.call_oi() + atm.put_oi(),
            net_gex,
            total_positive_gex,
            total_negative_gex,
            zero_gamma_level,
            atm_gex,
            gamma_concentration,
            pcr_oi,
            avg_call_iv: mean(&call_ivs),
            avg_put_iv: mean(&put_ivs),
            ce_itm_chg_oi,
            pe_itm_chg_oi,
            pcr: PcrBreakdown::from(&Buckets::split(strikes, atm.strike_price)),
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{Greeks, MarketData, OptionSide};

    pub(crate) fn side(oi: f64, prev_oi: f64, iv: f64, gamma: f64) -> Option<OptionSide> {
        Some(OptionSide {
            instrument_key: None,
            market_data: MarketData {
                oi,
                prev_oi,
                ..MarketData::default()
            },
            option_greeks: Greeks {
                iv,
                gamma,
                ..Greeks::default()
            },
        })
    }

    pub(crate) fn sample_strikes() -> Vec<StrikeRecord> {
        vec![
            StrikeRecord {
                strike_price: 100.0,
                underlying_spot_price: None,
                pcr: None,
                call_options: side(1_000.0, 1_500.0, 20.0, 0.01),
                put_options: side(200.0, 200.0, 24.0, 0.005),
            },
            StrikeRecord {
                strike_price: 105.0,
                underlying_spot_price: None,
                pcr: None,
                call_options: side(3_000.0, 2_800.0, 18.0, 0.04),
                put_options: side(2_000.0, 1_900.0, 22.0, 0.03),
            },
            StrikeRecord {
                strike_price: 110.0,
                underlying_spot_price: None,
                pcr: None,
                call_options: side(500.0, 400.0, 17.0, 0.01),
                put_options: side(1_500.0, 2_100.0, 25.0, 0.02),
            },
        ]
    }

    #[test]
    fn test_chain_metrics_compute() {
        let metrics = ChainMetrics::compute(&sample_strikes(), 104.0);

        assert_eq!(metrics.atm_strike, 105.0);
        assert_eq!(metrics.atm_iv, 20.0);
        assert_eq!(metrics.atm_oi, 5_000.0);
        assert_eq!(metrics.pcr_oi, 3_700.0 / 4_500.0);
        // ITM calls: strike 100 only, ITM puts: strikes 105 and 110
        assert_eq!(metrics.ce_itm_chg_oi, -500.0);
        assert_eq!(metrics.pe_itm_chg_oi, 100.0 - 600.0);
        assert!(metrics.gamma_concentration > 0.0 && metrics.gamma_concentration <= 1.0);
        assert_eq!(metrics.avg_call_iv, Some(55.0 / 3.0));
        assert_eq!(metrics.avg_put_iv, Some(71.0 / 3.0));
        // ATM strike excluded: puts 1500 + 200 over calls 1000 + 500
        assert_eq!(metrics.pcr.oi.overall, 1_700.0 / 1_500.0);
        assert_eq!(metrics.pcr.oi.itm, 1.5);
    }

    #[test]
    fn test_leg_gex_sign_convention() {
        let gex = strike_gex(&sample_strikes(), 100.0);
        assert!(gex.iter().all(|level| level.call_gex >= 0.0));
        assert!(gex.iter().all(|level| level.put_gex <= 0.0));

        // gamma 0.04 × OI 3000 × 100 × 100² × 0.01
        assert!((gex[1].call_gex - 1_200_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_chain_metrics_empty_chain() {
        let metrics = ChainMetrics::compute(&[], 101.0);
        assert_eq!(metrics.spot_price, 101.0);
        assert_eq!(metrics.atm_strike, 0.0);
        assert_eq!(metrics.zero_gamma_level, None);
    }
}
