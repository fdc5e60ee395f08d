use crate::{
    chain::metrics::ChainMetrics, derivative::Derivatives, instrument::SymbolClass,
    sentiment::SentimentScore, signal::BlastSignal,
};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Primary key of a [`SummaryRow`].
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct SummaryKey {
    pub time: DateTime<Utc>,
    pub symbol: SmolStr,
    pub expiry: NaiveDate,
}

/// Derived scalar metrics, sentiment and the precursor signal for (symbol, expiry) at a timestamp.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SummaryRow {
    pub time: DateTime<Utc>,
    pub symbol: SmolStr,
    pub expiry: NaiveDate,
    pub class: SymbolClass,
    pub metrics: ChainMetrics,
    pub derivatives: Derivatives,
    pub signal: BlastSignal,
    pub sentiment: SentimentScore,
}

impl SummaryRow {
    pub fn key(&self) -> SummaryKey {
        SummaryKey {
            time: self.time,
            symbol: self.symbol.clone(),
            expiry: self.expiry,
        }
    }
}

/// Truncate to whole seconds so a re-fetch within the same second upserts one key.
pub fn summary_time(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(0)
}
