use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide operational counters, shared by both cadence loops.
#[derive(Debug, Default)]
pub struct ServiceHealth {
    passes: AtomicU64,
    failed_passes: AtomicU64,
    symbols_succeeded: AtomicU64,
    symbols_skipped: AtomicU64,
    symbols_failed: AtomicU64,
    rate_limit_hits: AtomicU64,
    credential_refreshes: AtomicU64,
    store_write_failures: AtomicU64,
    store_read_failures: AtomicU64,
}

/// Point-in-time copy of [`ServiceHealth`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct HealthSnapshot {
    pub passes: u64,
    pub failed_passes: u64,
    pub symbols_succeeded: u64,
    pub symbols_skipped: u64,
    pub symbols_failed: u64,
    pub rate_limit_hits: u64,
    pub credential_refreshes: u64,
    pub store_write_failures: u64,
    pub store_read_failures: u64,
}

impl ServiceHealth {
    pub fn record_pass(&self, succeeded: u64, skipped: u64, failed: u64) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.symbols_succeeded.fetch_add(succeeded, Ordering::Relaxed);
        self.symbols_skipped.fetch_add(skipped, Ordering::Relaxed);
        self.symbols_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_failed_pass(&self) {
        self.failed_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hits(&self, hits: u64) {
        self.rate_limit_hits.fetch_add(hits, Ordering::Relaxed);
    }

    /// Mirror the refresh total kept by the credential holder.
    pub fn sync_credential_refreshes(&self, total: u64) {
        self.credential_refreshes.fetch_max(total, Ordering::Relaxed);
    }

    pub fn record_store_write_failure(&self) {
        self.store_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_read_failure(&self) {
        self.store_read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            failed_passes: self.failed_passes.load(Ordering::Relaxed),
            symbols_succeeded: self.symbols_succeeded.load(Ordering::Relaxed),
            symbols_skipped: self.symbols_skipped.load(Ordering::Relaxed),
            symbols_failed: self.symbols_failed.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            credential_refreshes: self.credential_refreshes.load(Ordering::Relaxed),
            store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
            store_read_failures: self.store_read_failures.load(Ordering::Relaxed),
        }
    }
}
