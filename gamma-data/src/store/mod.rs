use crate::{chain::ChainSnapshot, error::DataError, summary::SummaryRow};
use async_trait::async_trait;
use chrono::NaiveDate;

/// [`SnapshotStore`] kept entirely in process memory.
pub mod in_memory;

pub use in_memory::InMemoryStore;

/// Most recent summary rows read back for derivative and detector history.
pub const HISTORY_LIMIT: usize = 20;

/// Append / upsert persistence of raw snapshots and summary rows.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Durable upsert of a raw chain keyed by (time, symbol, expiry).
    async fn write_snapshot(&self, snapshot: &ChainSnapshot) -> Result<(), DataError>;

    /// Durable upsert keyed by [`SummaryRow::key`].
    async fn upsert_summary(&self, row: &SummaryRow) -> Result<(), DataError>;

    /// Up to `limit` most recent rows for (symbol, expiry), timestamp descending.
    async fn recent_summaries(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        limit: usize,
    ) -> Result<Vec<SummaryRow>, DataError>;

    /// Latest row for `symbol` across all of its expiries.
    async fn latest_summary(&self, symbol: &str) -> Result<Option<SummaryRow>, DataError>;
}
