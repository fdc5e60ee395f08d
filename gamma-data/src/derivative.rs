use crate::{instrument::SymbolClass, summary::SummaryRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored rows considered when searching for distinct prior observations.
pub const DERIVATIVE_LOOKBACK: usize = 10;

/// Distinct prior observations retained after de-duplication.
pub const DISTINCT_RETAINED: usize = 3;

/// Time-series derivatives of ATM OI, ATM IV and gamma concentration.
///
/// Velocities are per second for [`SymbolClass::Index`] and per minute for
/// [`SymbolClass::Equity`].
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Derivatives {
    pub oi_velocity: f64,
    pub oi_acceleration: f64,
    pub iv_velocity: f64,
    pub iv_acceleration: f64,
    pub concentration_velocity: f64,
    /// Percent of previous OI unwound per hour, capped at 100.
    pub unwinding_intensity: f64,
    /// Percent of stored rows with IV strictly below the current IV.
    pub iv_percentile: f64,
    /// Upstream returned the same OI and IV as the prior accepted row.
    pub duplicate: bool,
}

/// Point of a (symbol, expiry) series the derivative engine operates on.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub oi: f64,
    pub iv: f64,
    pub concentration: f64,
}

impl Observation {
    fn same_reading(&self, other: &Observation) -> bool {
        self.oi == other.oi && self.iv == other.iv
    }
}

impl From<&SummaryRow> for Observation {
    fn from(row: &SummaryRow) -> Self {
        Self {
            time: row.time,
            oi: row.metrics.atm_oi,
            iv: row.metrics.atm_iv,
            concentration: row.metrics.gamma_concentration,
        }
    }
}

/// Symmetric bounds applied to velocities and accelerations.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DerivativeCaps {
    pub oi_velocity: f64,
    pub oi_acceleration: f64,
    pub iv_velocity: f64,
    pub iv_acceleration: f64,
    pub concentration_velocity: f64,
}

impl DerivativeCaps {
    pub fn for_class(class: SymbolClass) -> Self {
        match class {
            SymbolClass::Index => Self {
                oi_velocity: 50_000.0,
                oi_acceleration: 5_000.0,
                iv_velocity: 1.0,
                iv_acceleration: 0.1,
                concentration_velocity: 0.05,
            },
            SymbolClass::Equity => Self {
                oi_velocity: 500_000.0,
                oi_acceleration: 100_000.0,
                iv_velocity: 10.0,
                iv_acceleration: 2.0,
                concentration_velocity: 0.5,
            },
        }
    }
}

fn clamp(value: f64, cap: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-cap, cap)
    } else {
        0.0
    }
}

/// Compute derivatives of `current` against `history` (timestamp descending, at most 20
/// rows as returned by the store).
pub fn compute(class: SymbolClass, current: Observation, history: &[SummaryRow]) -> Derivatives {
    let caps = DerivativeCaps::for_class(class);

    // Rows at or after the current instant belong to a re-fetch of the same second
    let prior = history
        .iter()
        .filter(|row| row.time < current.time)
        .collect::<Vec<_>>();

    let iv_percentile = iv_percentile(current.iv, &prior);

    // Chronological walk over the lookback window, dropping repeats of the last accepted row
    let mut distinct: Vec<Observation> = Vec::with_capacity(DERIVATIVE_LOOKBACK);
    for row in prior.iter().take(DERIVATIVE_LOOKBACK).rev() {
        let observation = Observation::from(*row);
        match distinct.last() {
            Some(last) if last.same_reading(&observation) => {}
            _ => distinct.push(observation),
        }
    }
    let distinct = &distinct[distinct.len().saturating_sub(DISTINCT_RETAINED)..];

    let Some(latest) = distinct.last() else {
        return Derivatives {
            iv_percentile,
            ..Derivatives::default()
        };
    };

    if latest.same_reading(&current) {
        let carried = prior
            .first()
            .map(|row| row.derivatives)
            .unwrap_or_default();
        return Derivatives {
            iv_percentile,
            duplicate: true,
            ..carried
        };
    }

    let elapsed = class.elapsed_units(current.time - latest.time);
    if elapsed <= 0.0 {
        return Derivatives {
            iv_percentile,
            ..Derivatives::default()
        };
    }

    let oi_velocity = clamp((current.oi - latest.oi) / elapsed, caps.oi_velocity);
    let iv_velocity = clamp((current.iv - latest.iv) / elapsed, caps.iv_velocity);
    let concentration_velocity = clamp(
        (current.concentration - latest.concentration) / elapsed,
        caps.concentration_velocity,
    );

    let (oi_acceleration, iv_acceleration) = match distinct {
        [.., previous, latest] => {
            let previous_elapsed = class.elapsed_units(latest.time - previous.time);
            if previous_elapsed > 0.0 {
                let previous_oi_velocity =
                    clamp((latest.oi - previous.oi) / previous_elapsed, caps.oi_velocity);
                let previous_iv_velocity =
                    clamp((latest.iv - previous.iv) / previous_elapsed, caps.iv_velocity);
                (
                    clamp(
                        (oi_velocity - previous_oi_velocity) / elapsed,
                        caps.oi_acceleration,
                    ),
                    clamp(
                        (iv_velocity - previous_iv_velocity) / elapsed,
                        caps.iv_acceleration,
                    ),
                )
            } else {
                (0.0, 0.0)
            }
        }
        _ => (0.0, 0.0),
    };

    Derivatives {
        oi_velocity,
        oi_acceleration,
        iv_velocity,
        iv_acceleration,
        concentration_velocity,
        unwinding_intensity: unwinding_intensity(latest, &current),
        iv_percentile,
        duplicate: false,
    }
}

/// Percent of previous OI unwound, normalised per wall-clock hour and capped at 100.
fn unwinding_intensity(previous: &Observation, current: &Observation) -> f64 {
    if current.oi >= previous.oi || previous.oi <= 0.0 {
        return 0.0;
    }

    let hours = (current.time - previous.time).num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return 0.0;
    }

    let unwound_pct = (previous.oi - current.oi).abs() / previous.oi * 100.0;
    (unwound_pct / hours).min(100.0)
}

fn iv_percentile(current_iv: f64, prior: &[&SummaryRow]) -> f64 {
    if prior.is_empty() {
        return 50.0;
    }

    let below = prior
        .iter()
        .filter(|row| row.metrics.atm_iv < current_iv)
        .count();
    below as f64 / prior.len() as f64 * 100.0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{chain::metrics::ChainMetrics, sentiment::SentimentScore, signal::BlastSignal};
    use chrono::{TimeDelta, TimeZone};

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 27, 4, 0, 0).unwrap()
    }

    pub(crate) fn row(
        offset_secs: i64,
        oi: f64,
        iv: f64,
        derivatives: Derivatives,
    ) -> SummaryRow {
        SummaryRow {
            time: t0() + TimeDelta::seconds(offset_secs),
            symbol: "NIFTY".into(),
            expiry: chrono::NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
            class: SymbolClass::Index,
            metrics: ChainMetrics {
                atm_oi: oi,
                atm_iv: iv,
                gamma_concentration: 0.2,
                ..ChainMetrics::default()
            },
            derivatives,
            signal: BlastSignal::default(),
            sentiment: SentimentScore::default(),
        }
    }

    fn observation(offset_secs: i64, oi: f64, iv: f64) -> Observation {
        Observation {
            time: t0() + TimeDelta::seconds(offset_secs),
            oi,
            iv,
            concentration: 0.2,
        }
    }

    #[test]
    fn test_compute_cold_start() {
        let actual = compute(SymbolClass::Index, observation(0, 1_000.0, 15.0), &[]);
        assert_eq!(
            actual,
            Derivatives {
                iv_percentile: 50.0,
                ..Derivatives::default()
            }
        );
    }

    #[test]
    fn test_compute_duplicate_aware_elapsed() {
        // Descending: the t=60 row repeats t=30 and must not shorten the elapsed time
        let history = vec![
            row(60, 2_000.0, 15.0, Derivatives::default()),
            row(30, 2_000.0, 15.0, Derivatives::default()),
            row(0, 1_000.0, 14.0, Derivatives::default()),
        ];

        let actual = compute(SymbolClass::Index, observation(90, 2_600.0, 15.6), &history);

        // (2600 - 2000) / 60s, not / 30s
        assert_eq!(actual.oi_velocity, 10.0);
        assert!((actual.iv_velocity - 0.01).abs() < 1e-9);
        assert!(!actual.duplicate);

        // previous velocity (2000 - 1000) / 30s = 33.33, acceleration over 60s
        let expected_acceleration = (10.0 - 1_000.0 / 30.0) / 60.0;
        assert!((actual.oi_acceleration - expected_acceleration).abs() < 1e-9);
    }

    #[test]
    fn test_compute_duplicate_current_carries_forward() {
        let stored = Derivatives {
            oi_velocity: 4.0,
            iv_velocity: 0.02,
            ..Derivatives::default()
        };
        let history = vec![
            row(30, 2_000.0, 15.0, stored),
            row(0, 1_000.0, 14.0, Derivatives::default()),
        ];

        let actual = compute(SymbolClass::Index, observation(60, 2_000.0, 15.0), &history);

        assert!(actual.duplicate);
        assert_eq!(actual.oi_velocity, 4.0);
        assert_eq!(actual.iv_velocity, 0.02);
    }

    #[test]
    fn test_compute_ignores_same_second_rows() {
        let history = vec![
            row(30, 9_999.0, 30.0, Derivatives::default()),
            row(0, 1_000.0, 14.0, Derivatives::default()),
        ];

        let actual = compute(SymbolClass::Index, observation(30, 1_300.0, 14.0), &history);

        assert_eq!(actual.oi_velocity, 10.0);
        assert_eq!(actual.iv_percentile, 0.0);
    }

    #[test]
    fn test_compute_equity_minutes_and_unwinding() {
        let mut previous = row(0, 10_000.0, 20.0, Derivatives::default());
        previous.class = SymbolClass::Equity;

        // 2% of OI unwound in 3 minutes => 40% per hour
        let actual = compute(
            SymbolClass::Equity,
            observation(180, 9_800.0, 20.5),
            &[previous],
        );

        assert!((actual.oi_velocity - -200.0 / 3.0).abs() < 1e-9);
        assert!((actual.unwinding_intensity - 40.0).abs() < 1e-9);
        assert_eq!(actual.oi_acceleration, 0.0);
    }

    #[test]
    fn test_compute_clamps_velocity() {
        let history = vec![row(0, 1_000.0, 14.0, Derivatives::default())];

        let actual = compute(
            SymbolClass::Index,
            observation(1, 10_000_000.0, 14.0),
            &history,
        );

        assert_eq!(actual.oi_velocity, 50_000.0);
        assert_eq!(actual.unwinding_intensity, 0.0);
    }

    #[test]
    fn test_iv_percentile() {
        struct TestCase {
            current_iv: f64,
            expected: f64,
        }

        let history = vec![
            row(90, 1.0, 12.0, Derivatives::default()),
            row(60, 2.0, 14.0, Derivatives::default()),
            row(30, 3.0, 16.0, Derivatives::default()),
            row(0, 4.0, 18.0, Derivatives::default()),
        ];

        let tests = vec![
            TestCase {
                // TC0: above all
                current_iv: 20.0,
                expected: 100.0,
            },
            TestCase {
                // TC1: equal values are not below
                current_iv: 14.0,
                expected: 25.0,
            },
            TestCase {
                // TC2: below all
                current_iv: 10.0,
                expected: 0.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = compute(
                SymbolClass::Index,
                observation(120, 5.0, test.current_iv),
                &history,
            );
            assert_eq!(actual.iv_percentile, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_compute_acceleration_and_unwinding_caps() {
        struct TestCase {
            class: SymbolClass,
            // chronological (offset_secs, oi, iv), oldest first
            prior: Vec<(i64, f64, f64)>,
            current: (i64, f64, f64),
            expected_oi_acceleration: f64,
            expected_iv_acceleration: f64,
            expected_unwinding: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: index OI reversal saturates acceleration, full unwind caps at 100
                class: SymbolClass::Index,
                prior: vec![(0, 0.0, 15.0), (1, 1_000_000.0, 15.0)],
                current: (2, 0.0, 15.0),
                expected_oi_acceleration: -5_000.0,
                expected_iv_acceleration: 0.0,
                expected_unwinding: 100.0,
            },
            TestCase {
                // TC1: equity caps apply per minute
                class: SymbolClass::Equity,
                prior: vec![(0, 0.0, 20.0), (60, 10_000_000.0, 20.0)],
                current: (120, 0.0, 20.0),
                expected_oi_acceleration: -100_000.0,
                expected_iv_acceleration: 0.0,
                expected_unwinding: 100.0,
            },
            TestCase {
                // TC2: index IV whipsaw saturates IV acceleration
                class: SymbolClass::Index,
                prior: vec![(0, 1_000.0, 10.0), (1, 1_000.0, 20.0)],
                current: (2, 1_000.0, 10.0),
                expected_oi_acceleration: 0.0,
                expected_iv_acceleration: -0.1,
                expected_unwinding: 0.0,
            },
            TestCase {
                // TC3: equity IV whipsaw saturates at the equity cap
                class: SymbolClass::Equity,
                prior: vec![(0, 1_000.0, 10.0), (60, 1_000.0, 30.0)],
                current: (120, 1_000.0, 10.0),
                expected_oi_acceleration: 0.0,
                expected_iv_acceleration: -2.0,
                expected_unwinding: 0.0,
            },
            TestCase {
                // TC4: 10% unwound over an hour stays under the cap
                class: SymbolClass::Index,
                prior: vec![(0, 1_000.0, 15.0)],
                current: (3_600, 900.0, 15.0),
                expected_oi_acceleration: 0.0,
                expected_iv_acceleration: 0.0,
                expected_unwinding: 10.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let history = test
                .prior
                .iter()
                .rev()
                .map(|(offset, oi, iv)| row(*offset, *oi, *iv, Derivatives::default()))
                .collect::<Vec<_>>();
            let (offset, oi, iv) = test.current;

            let actual = compute(test.class, observation(offset, oi, iv), &history);

            assert_eq!(
                actual.oi_acceleration, test.expected_oi_acceleration,
                "TC{} failed",
                index
            );
            assert_eq!(
                actual.iv_acceleration, test.expected_iv_acceleration,
                "TC{} failed",
                index
            );
            assert!(
                (actual.unwinding_intensity - test.expected_unwinding).abs() < 1e-9,
                "TC{} failed",
                index
            );
        }
    }
}
