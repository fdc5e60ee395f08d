use crate::error::DataError;
use chrono::TimeDelta;
use derive_more::Display;
use fnv::FnvHashSet;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Segments whose records describe option underlyings.
const OPTION_SEGMENTS: [&str; 4] = ["NSE_FO", "BSE_FO", "NSE_INDEX", "BSE_INDEX"];

/// Instrument class of an option underlying.
///
/// Determines polling cadence and the time unit used by derivative math: seconds for
/// [`SymbolClass::Index`], minutes for [`SymbolClass::Equity`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolClass {
    #[display("INDEX")]
    Index,
    #[display("EQUITY")]
    Equity,
}

impl SymbolClass {
    /// Express an elapsed duration in this class's derivative time unit.
    pub fn elapsed_units(&self, elapsed: TimeDelta) -> f64 {
        let seconds = elapsed.num_milliseconds() as f64 / 1000.0;
        match self {
            SymbolClass::Index => seconds,
            SymbolClass::Equity => seconds / 60.0,
        }
    }
}

/// Option underlying polled by the service.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[display("{name}")]
pub struct Symbol {
    /// Trading identifier, eg/ "NIFTY" or "RELIANCE".
    pub name: SmolStr,
    /// Upstream instrument key, eg/ "NSE_INDEX|Nifty 50".
    pub instrument_key: SmolStr,
    pub class: SymbolClass,
}

impl Symbol {
    pub fn new(
        name: impl Into<SmolStr>,
        instrument_key: impl Into<SmolStr>,
        class: SymbolClass,
    ) -> Self {
        Self {
            name: name.into(),
            instrument_key: instrument_key.into(),
            class,
        }
    }

    pub fn index(name: impl Into<SmolStr>, instrument_key: impl Into<SmolStr>) -> Self {
        Self::new(name, instrument_key, SymbolClass::Index)
    }

    pub fn equity(name: impl Into<SmolStr>, instrument_key: impl Into<SmolStr>) -> Self {
        Self::new(name, instrument_key, SymbolClass::Equity)
    }
}

/// Index underlyings polled by the fast loop when no explicit set is configured.
pub fn default_index_symbols() -> Vec<Symbol> {
    vec![
        Symbol::index("NIFTY", "NSE_INDEX|Nifty 50"),
        Symbol::index("BANKNIFTY", "NSE_INDEX|Nifty Bank"),
        Symbol::index("FINNIFTY", "NSE_INDEX|Nifty Fin Service"),
        Symbol::index("MIDCPNIFTY", "NSE_INDEX|NIFTY MID SELECT"),
        Symbol::index("SENSEX", "BSE_INDEX|SENSEX"),
    ]
}

impl SymbolClass {
    /// Infer the class from an upstream instrument key, eg/ "NSE_INDEX|Nifty 50".
    pub fn from_instrument_key(instrument_key: &str) -> Self {
        match instrument_key.split_once('|') {
            Some((segment, _)) if segment.ends_with("_INDEX") => SymbolClass::Index,
            _ => SymbolClass::Equity,
        }
    }
}

/// One record of an instruments dump. F&O rows carry the underlying in `asset_*`.
#[derive(Debug, Deserialize)]
struct InstrumentRecord {
    #[serde(default)]
    segment: Option<String>,
    #[serde(default)]
    asset_symbol: Option<String>,
    #[serde(default)]
    asset_key: Option<String>,
    #[serde(default)]
    trading_symbol: Option<String>,
    #[serde(default)]
    instrument_key: Option<String>,
}

impl InstrumentRecord {
    fn underlying(self) -> Option<Symbol> {
        if let Some(segment) = &self.segment {
            if !OPTION_SEGMENTS.contains(&segment.as_str()) {
                return None;
            }
        }

        let name = self.asset_symbol.or(self.trading_symbol)?;
        let key = self.asset_key.or(self.instrument_key)?;
        let (name, key) = (name.trim(), key.trim());
        if name.is_empty() || key.is_empty() {
            return None;
        }

        Some(Symbol::new(name, key, SymbolClass::from_instrument_key(key)))
    }
}

/// Symbol universe partitioned between the fast and slow cadence loops.
///
/// The fast set holds the built-in index set plus every other index underlying. The slow
/// set holds equity underlyings only and never repeats a fast symbol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Universe {
    pub fast: Vec<Symbol>,
    pub slow: Vec<Symbol>,
}

impl Universe {
    pub fn split(fast: Vec<Symbol>, candidates: impl IntoIterator<Item = Symbol>) -> Self {
        let owned = fast
            .iter()
            .map(|symbol| symbol.name.clone())
            .collect::<FnvHashSet<_>>();

        let (indices, equities): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .filter(|symbol| !owned.contains(&symbol.name))
            .map(|symbol| (symbol.name.clone(), symbol))
            .collect::<IndexMap<_, _>>()
            .into_values()
            .partition(|symbol| symbol.class == SymbolClass::Index);

        let mut fast = fast;
        fast.extend(indices);

        Self {
            fast,
            slow: equities,
        }
    }

    /// Symbols owned by one [`Tier`].
    pub fn into_tier(self, tier: Tier) -> Vec<Symbol> {
        match tier {
            Tier::Fast => self.fast,
            Tier::Slow => self.slow,
        }
    }

    /// Built-in index set only.
    pub fn default_indices() -> Self {
        Self::split(default_index_symbols(), [])
    }

    /// Parse an instruments JSON array and split it against the built-in index set.
    pub fn from_instruments_json(json: &str) -> Result<Self, DataError> {
        let records = serde_json::from_str::<Vec<InstrumentRecord>>(json)
            .map_err(|error| DataError::Universe(error.to_string()))?;

        let universe = Self::split(
            default_index_symbols(),
            records.into_iter().filter_map(InstrumentRecord::underlying),
        );
        debug!(fast = universe.fast.len(), slow = universe.slow.len(), "symbol universe built");
        Ok(universe)
    }

    pub async fn load(path: &Path) -> Result<Self, DataError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|error| {
            DataError::Universe(format!("failed to read {}: {error}", path.display()))
        })?;
        Self::from_instruments_json(&contents)
    }

    pub fn len(&self) -> usize {
        self.fast.len() + self.slow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fast.is_empty() && self.slow.is_empty()
    }
}

/// Cadence loop a symbol belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[display("fast")]
    Fast,
    #[display("slow")]
    Slow,
}

/// Where a cadence loop takes its symbols from at the start of every pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolSource {
    Fixed(Vec<Symbol>),
    /// Instruments file, re-read every pass so universe edits apply without a restart.
    File { path: PathBuf, tier: Tier },
}

impl SymbolSource {
    pub fn file(path: impl Into<PathBuf>, tier: Tier) -> Self {
        SymbolSource::File {
            path: path.into(),
            tier,
        }
    }

    /// `true` when the symbol set can never change.
    pub fn is_fixed(&self) -> bool {
        matches!(self, SymbolSource::Fixed(_))
    }

    pub async fn load(&self) -> Result<Vec<Symbol>, DataError> {
        match self {
            SymbolSource::Fixed(symbols) => Ok(symbols.clone()),
            SymbolSource::File { path, tier } => {
                Universe::load(path).await.map(|universe| universe.into_tier(*tier))
            }
        }
    }
}
