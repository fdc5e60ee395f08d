use super::{HISTORY_LIMIT, SnapshotStore};
use crate::{chain::ChainSnapshot, config::StoreConfig, error::DataError, summary::SummaryRow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::collections::BTreeMap;

type SeriesKey = (SmolStr, NaiveDate);

/// Process-local [`SnapshotStore`] with bounded raw and summary series.
#[derive(Debug)]
pub struct InMemoryStore {
    raw_retention: usize,
    summary_retention: usize,
    snapshots: RwLock<FnvHashMap<SeriesKey, BTreeMap<DateTime<Utc>, ChainSnapshot>>>,
    summaries: RwLock<BTreeMap<SeriesKey, BTreeMap<DateTime<Utc>, SummaryRow>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl InMemoryStore {
    /// Summary retention is raised to [`HISTORY_LIMIT`] so detector history stays whole.
    pub fn new(raw_retention: usize, summary_retention: usize) -> Self {
        Self {
            raw_retention: raw_retention.max(1),
            summary_retention: summary_retention.max(HISTORY_LIMIT),
            snapshots: RwLock::new(FnvHashMap::default()),
            summaries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.raw_retention, config.summary_retention)
    }

    /// Latest row of every symbol, ordered by symbol.
    pub fn latest_per_symbol(&self) -> Vec<SummaryRow> {
        let summaries = self.summaries.read();
        let mut latest: BTreeMap<&SmolStr, &SummaryRow> = BTreeMap::new();

        for ((symbol, _), series) in summaries.iter() {
            let Some((_, row)) = series.last_key_value() else {
                continue;
            };
            latest
                .entry(symbol)
                .and_modify(|current| {
                    if row.time > current.time {
                        *current = row;
                    }
                })
                .or_insert(row);
        }

        latest.into_values().cloned().collect()
    }

    pub fn summary_count(&self) -> usize {
        self.summaries.read().values().map(BTreeMap::len).sum()
    }

    pub fn snapshot_count(&self, symbol: &str, expiry: NaiveDate) -> usize {
        self.snapshots
            .read()
            .get(&(SmolStr::new(symbol), expiry))
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn write_snapshot(&self, snapshot: &ChainSnapshot) -> Result<(), DataError> {
        let mut snapshots = self.snapshots.write();
        let series = snapshots
            .entry((snapshot.symbol.clone(), snapshot.expiry))
            .or_default();

        series.insert(snapshot.time, snapshot.clone());
        while series.len() > self.raw_retention {
            series.pop_first();
        }
        Ok(())
    }

    async fn upsert_summary(&self, row: &SummaryRow) -> Result<(), DataError> {
        let key = row.key();
        let mut summaries = self.summaries.write();
        let series = summaries.entry((key.symbol, key.expiry)).or_default();

        series.insert(key.time, row.clone());
        while series.len() > self.summary_retention {
            series.pop_first();
        }
        Ok(())
    }

    async fn recent_summaries(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        limit: usize,
    ) -> Result<Vec<SummaryRow>, DataError> {
        Ok(self
            .summaries
            .read()
            .get(&(SmolStr::new(symbol), expiry))
            .map(|series| series.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn latest_summary(&self, symbol: &str) -> Result<Option<SummaryRow>, DataError> {
        Ok(self
            .summaries
            .read()
            .iter()
            .filter(|((series_symbol, _), _)| series_symbol == symbol)
            .filter_map(|(_, series)| series.last_key_value())
            .max_by_key(|(time, _)| **time)
            .map(|(_, row)| row.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivative::{Derivatives, tests::row};

    #[tokio::test]
    async fn test_upsert_summary_same_key_replaces() {
        let store = InMemoryStore::default();
        let first = row(0, 1_000.0, 15.0, Derivatives::default());
        let mut second = first.clone();
        second.metrics.atm_oi = 2_000.0;

        store.upsert_summary(&first).await.unwrap();
        store.upsert_summary(&second).await.unwrap();

        assert_eq!(store.summary_count(), 1);
        let latest = store.latest_summary("NIFTY").await.unwrap().unwrap();
        assert_eq!(latest.metrics.atm_oi, 2_000.0);
    }

    #[tokio::test]
    async fn test_recent_summaries_descending_and_limited() {
        let store = InMemoryStore::default();
        for offset in 0..25 {
            store
                .upsert_summary(&row(offset * 30, offset as f64, 15.0, Derivatives::default()))
                .await
                .unwrap();
        }

        let recent = store
            .recent_summaries("NIFTY", NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(), 20)
            .await
            .unwrap();

        assert_eq!(recent.len(), 20);
        assert_eq!(recent[0].metrics.atm_oi, 24.0);
        assert!(recent.windows(2).all(|pair| pair[0].time > pair[1].time));

        let other = store
            .recent_summaries("BANKNIFTY", NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(), 20)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_latest_per_symbol_across_expiries() {
        let store = InMemoryStore::default();
        let near = row(0, 1.0, 15.0, Derivatives::default());
        let mut next = row(30, 2.0, 15.0, Derivatives::default());
        next.expiry = NaiveDate::from_ymd_opt(2025, 2, 6).unwrap();
        let mut other = row(60, 3.0, 15.0, Derivatives::default());
        other.symbol = "BANKNIFTY".into();

        for row in [&near, &next, &other] {
            store.upsert_summary(row).await.unwrap();
        }

        let latest = store.latest_per_symbol();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].symbol, "BANKNIFTY");
        assert_eq!(latest[1].expiry, next.expiry);
    }

    #[tokio::test]
    async fn test_write_snapshot_retention() {
        let store = InMemoryStore::new(2, HISTORY_LIMIT);
        let symbol = crate::instrument::Symbol::index("NIFTY", "NSE_INDEX|Nifty 50");
        let expiry = NaiveDate::from_ymd_opt(2025, 1, 30).unwrap();

        for offset in 0..4 {
            let snapshot = ChainSnapshot::new(
                crate::derivative::tests::t0() + chrono::TimeDelta::seconds(offset),
                &symbol,
                expiry,
                vec![],
            );
            store.write_snapshot(&snapshot).await.unwrap();
        }

        assert_eq!(store.snapshot_count("NIFTY", expiry), 2);
    }

    #[tokio::test]
    async fn test_upsert_summary_retention() {
        struct TestCase {
            retention: usize,
            rows: i64,
            expected_count: usize,
        }

        let tests = vec![
            TestCase {
                // TC0: series trimmed to the configured retention
                retention: 25,
                rows: 40,
                expected_count: 25,
            },
            TestCase {
                // TC1: retention below the history window is raised to it
                retention: 5,
                rows: 30,
                expected_count: HISTORY_LIMIT,
            },
            TestCase {
                // TC2: under the retention nothing is dropped
                retention: 500,
                rows: 12,
                expected_count: 12,
            },
        ];

        let expiry = NaiveDate::from_ymd_opt(2025, 1, 30).unwrap();

        for (index, test) in tests.into_iter().enumerate() {
            let store = InMemoryStore::new(50, test.retention);
            for offset in 0..test.rows {
                store
                    .upsert_summary(&row(offset * 30, offset as f64, 15.0, Derivatives::default()))
                    .await
                    .unwrap();
            }

            assert_eq!(store.summary_count(), test.expected_count, "TC{} failed", index);
            let latest = store.latest_summary("NIFTY").await.unwrap().unwrap();
            assert_eq!(latest.metrics.atm_oi, (test.rows - 1) as f64, "TC{} failed", index);
            let recent = store.recent_summaries("NIFTY", expiry, HISTORY_LIMIT).await.unwrap();
            assert_eq!(
                recent.len(),
                test.expected_count.min(HISTORY_LIMIT),
                "TC{} failed",
                index
            );
        }
    }
}
