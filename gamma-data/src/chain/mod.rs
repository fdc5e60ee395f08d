use crate::instrument::Symbol;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

/// ITM / OTM aggregation around the ATM strike and bucketed put/call ratios.
pub mod buckets;

/// Scalar metrics derived from a [`ChainSnapshot`].
pub mod metrics;

/// Per-leg price and open interest build-up classification.
pub mod position;

/// Per-side market data for one strike.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct MarketData {
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub ltp: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub volume: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub oi: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub prev_oi: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub close_price: f64,
}

/// Pre-computed greeks delivered by the upstream feed. Implied volatility is in percent.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Greeks {
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub iv: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub delta: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub gamma: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub theta: f64,
    #[serde(default, deserialize_with = "de_f64_or_zero")]
    pub vega: f64,
}

/// Call or put side of a strike.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct OptionSide {
    #[serde(default)]
    pub instrument_key: Option<SmolStr>,
    #[serde(default)]
    pub market_data: MarketData,
    #[serde(default)]
    pub option_greeks: Greeks,
}

impl OptionSide {
    /// Change in open interest since the previous session.
    pub fn chg_oi(&self) -> f64 {
        self.market_data.oi - self.market_data.prev_oi
    }
}

/// One strike row of an option chain.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct StrikeRecord {
    pub strike_price: f64,
    #[serde(default)]
    pub underlying_spot_price: Option<f64>,
    #[serde(default)]
    pub pcr: Option<f64>,
    #[serde(default)]
    pub call_options: Option<OptionSide>,
    #[serde(default)]
    pub put_options: Option<OptionSide>,
}

impl StrikeRecord {
    pub fn call_oi(&self) -> f64 {
        self.call_options.as_ref().map_or(0.0, |side| side.market_data.oi)
    }

    pub fn put_oi(&self) -> f64 {
        self.put_options.as_ref().map_or(0.0, |side| side.market_data.oi)
    }
}

/// Immutable raw option chain for (Symbol, Expiry) at a point in time.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ChainSnapshot {
    pub time: DateTime<Utc>,
    pub symbol: SmolStr,
    pub instrument_key: SmolStr,
    pub expiry: NaiveDate,
    pub spot_price: f64,
    pub strikes: Vec<StrikeRecord>,
}

impl ChainSnapshot {
    pub fn new(
        time: DateTime<Utc>,
        symbol: &Symbol,
        expiry: NaiveDate,
        mut strikes: Vec<StrikeRecord>,
    ) -> Self {
        strikes.sort_by(|a, b| a.strike_price.total_cmp(&b.strike_price));
        let spot_price = resolve_spot_price(&strikes);

        Self {
            time,
            symbol: symbol.name.clone(),
            instrument_key: symbol.instrument_key.clone(),
            expiry,
            spot_price,
            strikes,
        }
    }
}

/// Determine spot from strike records: the first reported `underlying_spot_price`, else
/// the middle strike as an approximation. Expects strikes sorted ascending.
pub fn resolve_spot_price(strikes: &[StrikeRecord]) -> f64 {
    if let Some(spot) = strikes
        .iter()
        .filter_map(|strike| strike.underlying_spot_price)
        .find(|spot| *spot > 0.0)
    {
        return spot;
    }

    let positive = strikes
        .iter()
        .map(|strike| strike.strike_price)
        .filter(|strike| *strike > 0.0)
        .collect::<Vec<_>>();

    positive.get(positive.len() / 2).copied().unwrap_or(0.0)
}

/// Deserialize a nullable number as `0.0` when null.
fn de_f64_or_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer).map(|value| value.unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strike(price: f64, spot: Option<f64>) -> StrikeRecord {
        StrikeRecord {
            strike_price: price,
            underlying_spot_price: spot,
            pcr: None,
            call_options: None,
            put_options: None,
        }
    }

    #[test]
    fn test_resolve_spot_price() {
        struct TestCase {
            input: Vec<StrikeRecord>,
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: reported spot wins
                input: vec![strike(100.0, Some(104.5)), strike(110.0, Some(104.5))],
                expected: 104.5,
            },
            TestCase {
                // TC1: no spot reported, middle strike used
                input: vec![strike(100.0, None), strike(110.0, None), strike(120.0, None)],
                expected: 110.0,
            },
            TestCase {
                // TC2: zero spot ignored
                input: vec![strike(100.0, Some(0.0)), strike(110.0, None)],
                expected: 110.0,
            },
            TestCase {
                // TC3: empty chain
                input: vec![],
                expected: 0.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(resolve_spot_price(&test.input), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_strike_record_de_with_nulls() {
        let input = r#"
            {
                "expiry": "2025-01-30",
                "pcr": 0.82,
                "strike_price": 23500.0,
                "underlying_key": "NSE_INDEX|Nifty 50",
                "underlying_spot_price": 23512.35,
                "call_options": {
                    "instrument_key": "NSE_FO|45123",
                    "market_data": {
                        "ltp": 120.5, "volume": 1500000, "oi": 4200000,
                        "close_price": 98.0, "bid_price": 120.1, "bid_qty": 75,
                        "ask_price": 120.6, "ask_qty": 150, "prev_oi": 3900000
                    },
                    "option_greeks": {
                        "vega": 11.2, "theta": -8.1, "gamma": 0.0009,
                        "delta": 0.52, "iv": 13.4, "pop": 48.2
                    }
                },
                "put_options": {
                    "instrument_key": "NSE_FO|45124",
                    "market_data": { "ltp": 101.0, "volume": null, "oi": 3100000, "prev_oi": 3300000 },
                    "option_greeks": { "iv": null, "gamma": 0.0008 }
                }
            }
        "#;

        let actual = serde_json::from_str::<StrikeRecord>(input).unwrap();
        let put = actual.put_options.as_ref().unwrap();

        assert_eq!(actual.strike_price, 23500.0);
        assert_eq!(actual.call_oi(), 4_200_000.0);
        assert_eq!(actual.call_options.as_ref().unwrap().chg_oi(), 300_000.0);
        assert_eq!(put.market_data.volume, 0.0);
        assert_eq!(put.option_greeks.iv, 0.0);
        assert_eq!(put.chg_oi(), -200_000.0);
    }
}
