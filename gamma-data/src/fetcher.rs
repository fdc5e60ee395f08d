use crate::{
    chain::{ChainSnapshot, StrikeRecord, metrics::ChainMetrics},
    config::{ExpiryConfig, FetcherConfig},
    credential::CredentialStore,
    derivative::{self, Observation},
    detector::{self, DetectorInput},
    error::{DataError, ErrorKind},
    expiry::ExpiryResolver,
    health::ServiceHealth,
    instrument::Symbol,
    policy::RetryPolicy,
    scheduler::sleep_or_shutdown,
    sentiment::SentimentScore,
    store::{HISTORY_LIMIT, SnapshotStore},
    summary::{SummaryRow, summary_time},
    upstream::MarketDataApi,
};
use chrono::{DateTime, NaiveDate, Utc};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of fetching every resolved expiry of one symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// At least one expiry went through the full pipeline.
    Success { expiries: usize },
    /// Upstream rate limit outlasted the retries. Not counted as a failure.
    Skipped,
    Failed(DataError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolReport {
    pub symbol: SmolStr,
    pub outcome: FetchOutcome,
    pub rate_limit_hits: u32,
}

impl SymbolReport {
    fn failure_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            FetchOutcome::Failed(error) => Some(error.kind()),
            _ => None,
        }
    }
}

/// Tally of one scheduling pass over a symbol subset.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct PassReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub network_failures: usize,
    pub rate_limit_hits: u64,
    pub batches: usize,
    pub interrupted: bool,
}

impl PassReport {
    fn tally(&mut self, report: &SymbolReport) {
        self.attempted += 1;
        self.rate_limit_hits += u64::from(report.rate_limit_hits);
        match &report.outcome {
            FetchOutcome::Success { .. } => self.succeeded += 1,
            FetchOutcome::Skipped => self.skipped += 1,
            FetchOutcome::Failed(error) => {
                self.failed += 1;
                if error.kind() == ErrorKind::Network {
                    self.network_failures += 1;
                }
            }
        }
    }
}

/// Rate-limited, batch-concurrent option-chain fetcher and processing pipeline.
#[derive(Clone)]
pub struct Fetcher {
    api: Arc<dyn MarketDataApi>,
    store: Arc<dyn SnapshotStore>,
    resolver: ExpiryResolver,
    credentials: CredentialStore,
    policy: RetryPolicy,
    config: FetcherConfig,
    expiry: ExpiryConfig,
    health: Arc<ServiceHealth>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("resolver", &self.resolver)
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Fetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn MarketDataApi>,
        store: Arc<dyn SnapshotStore>,
        resolver: ExpiryResolver,
        credentials: CredentialStore,
        policy: RetryPolicy,
        config: FetcherConfig,
        expiry: ExpiryConfig,
        health: Arc<ServiceHealth>,
    ) -> Self {
        Self {
            api,
            store,
            resolver,
            credentials,
            policy,
            config,
            expiry,
            health,
        }
    }

    pub fn health(&self) -> &Arc<ServiceHealth> {
        &self.health
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Run one pass over `symbols` in fixed-size batches with a bounded worker count.
    ///
    /// Fails with `CredentialExpired` when a credential failure survives a refresh (the
    /// remaining batches are abandoned) and with `Network` when every attempted symbol
    /// failed on the network. Shutdown is checked between batches.
    pub async fn run_pass(
        &self,
        symbols: &[Symbol],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PassReport, DataError> {
        let mut shutdown = shutdown.clone();
        let mut report = PassReport::default();
        let batches = symbols.chunks(self.config.batch_size.max(1)).collect::<Vec<_>>();

        for (index, batch) in batches.iter().enumerate() {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            // Owned futures keep the pass future Send for spawned loops
            let reports = stream::iter(batch.to_vec())
                .map(|symbol| {
                    let fetcher = self.clone();
                    async move { fetcher.fetch(&symbol).await }
                })
                .buffer_unordered(self.config.workers.max(1))
                .collect::<Vec<_>>()
                .await;
            report.batches += 1;

            reports.iter().for_each(|symbol_report| report.tally(symbol_report));
            self.health
                .record_rate_limit_hits(reports.iter().map(|r| u64::from(r.rate_limit_hits)).sum());

            if let Some(credential) = reports
                .iter()
                .find(|r| r.failure_kind() == Some(ErrorKind::CredentialExpired))
            {
                self.record(&report);
                error!(
                    symbol = %credential.symbol,
                    remaining_batches = batches.len() - index - 1,
                    "credential still rejected after refresh, abandoning pass"
                );
                return Err(DataError::CredentialExpired(format!(
                    "credential rejected while fetching {}",
                    credential.symbol
                )));
            }

            if index + 1 == batches.len() {
                break;
            }

            let delay = if reports.iter().all(|r| r.rate_limit_hits > 0) {
                warn!(
                    batch = index,
                    cooldown = ?self.config.rate_limit_cooldown(),
                    "whole batch rate limited, cooling down"
                );
                self.config.rate_limit_cooldown()
            } else {
                self.config.batch_delay()
            };

            if sleep_or_shutdown(delay, &mut shutdown).await {
                report.interrupted = true;
                break;
            }
        }

        self.record(&report);

        if report.attempted > 0 && report.network_failures == report.attempted {
            return Err(DataError::Network(format!(
                "all {} symbols failed with network errors",
                report.attempted
            )));
        }

        Ok(report)
    }

    fn record(&self, report: &PassReport) {
        self.health.record_pass(
            report.succeeded as u64,
            report.skipped as u64,
            report.failed as u64,
        );
        self.health
            .sync_credential_refreshes(self.credentials.refresh_count());
    }

    /// Resolve expiries for `symbol` and run the pipeline for each.
    pub async fn fetch(&self, symbol: &Symbol) -> SymbolReport {
        let max_count = self.expiry.max_count(symbol.class);
        let resolved = match self.resolver.resolve(symbol, max_count, Utc::now()).await {
            Ok(resolved) => resolved,
            Err(error) => {
                let hits = u32::from(error.is_rate_limited());
                return classify(symbol, vec![error], hits);
            }
        };

        let mut rate_limit_hits = resolved.rate_limit_hits;
        let mut succeeded = 0;
        let mut errors = Vec::new();

        for expiry in resolved.expiries {
            let api = Arc::clone(&self.api);
            let instrument_key = symbol.instrument_key.clone();
            let attempted = self
                .policy
                .execute(
                    &self.credentials,
                    self.config.request_spacing(),
                    &symbol.name,
                    move |credential| {
                        let api = Arc::clone(&api);
                        let instrument_key = instrument_key.clone();
                        async move { api.option_chain(&credential, &instrument_key, expiry).await }
                    },
                )
                .await;
            rate_limit_hits += attempted.rate_limit_hits;

            match attempted.result {
                Ok(strikes) if strikes.is_empty() => {
                    warn!(%symbol, %expiry, "empty option chain");
                    errors.push(DataError::NoContracts(format!(
                        "{} {expiry}",
                        symbol.instrument_key
                    )));
                }
                Ok(strikes) => {
                    self.process_chain(symbol, expiry, strikes, Utc::now()).await;
                    succeeded += 1;
                }
                Err(error) => {
                    warn!(%symbol, %expiry, %error, "option chain fetch failed");
                    errors.push(error);
                }
            }
        }

        if succeeded > 0 {
            return SymbolReport {
                symbol: symbol.name.clone(),
                outcome: FetchOutcome::Success {
                    expiries: succeeded,
                },
                rate_limit_hits,
            };
        }

        classify(symbol, errors, rate_limit_hits)
    }

    /// Store raw → metrics → derivatives → detector → upsert summary.
    ///
    /// Store failures are logged and counted, they never abort the pipeline.
    pub async fn process_chain(
        &self,
        symbol: &Symbol,
        expiry: NaiveDate,
        strikes: Vec<StrikeRecord>,
        fetched_at: DateTime<Utc>,
    ) -> SummaryRow {
        let time = summary_time(fetched_at);
        let snapshot = ChainSnapshot::new(time, symbol, expiry, strikes);

        if let Err(error) = self.store.write_snapshot(&snapshot).await {
            self.health.record_store_write_failure();
            error!(%symbol, %expiry, %error, "failed to write raw snapshot");
        }

        let metrics = ChainMetrics::from_snapshot(&snapshot);

        let history = match self
            .store
            .recent_summaries(&symbol.name, expiry, HISTORY_LIMIT)
            .await
        {
            Ok(history) => history
                .into_iter()
                .filter(|row| row.time < time)
                .collect::<Vec<_>>(),
            Err(error) => {
                self.health.record_store_read_failure();
                warn!(%symbol, %expiry, %error, "history unavailable, computing from cold start");
                Vec::new()
            }
        };

        let derivatives = derivative::compute(
            symbol.class,
            Observation {
                time,
                oi: metrics.atm_oi,
                iv: metrics.atm_iv,
                concentration: metrics.gamma_concentration,
            },
            &history,
        );

        let signal = detector::detect(DetectorInput {
            class: symbol.class,
            metrics: &metrics,
            derivatives: &derivatives,
            history: &history,
        });

        let sentiment =
            SentimentScore::compute(&snapshot.strikes, snapshot.spot_price, &metrics.pcr);

        let row = SummaryRow {
            time,
            symbol: symbol.name.clone(),
            expiry,
            class: symbol.class,
            metrics,
            derivatives,
            signal,
            sentiment,
        };

        if let Err(error) = self.store.upsert_summary(&row).await {
            self.health.record_store_write_failure();
            error!(%symbol, %expiry, %error, "failed to upsert summary row");
        }

        debug!(
            %symbol,
            %expiry,
            spot = row.metrics.spot_price,
            atm_strike = row.metrics.atm_strike,
            net_gex = row.metrics.net_gex,
            pcr_oi = row.metrics.pcr.oi.overall,
            sentiment = %row.sentiment.sentiment,
            sentiment_score = row.sentiment.score,
            duplicate = row.derivatives.duplicate,
            "chain processed"
        );
        if !row.signal.triggers.is_empty() {
            info!(
                %symbol,
                %expiry,
                probability = row.signal.probability,
                direction = %row.signal.direction,
                confidence = %row.signal.confidence,
                triggers = ?row.signal.triggers,
                "blast precursor"
            );
        }

        row
    }
}

/// Outcome of a symbol with no successful expiry.
///
/// A credential failure dominates, then an exhausted rate limit, then the last error.
fn classify(symbol: &Symbol, mut errors: Vec<DataError>, rate_limit_hits: u32) -> SymbolReport {
    let outcome = if let Some(credential) = errors
        .iter()
        .find(|error| error.kind() == ErrorKind::CredentialExpired)
    {
        FetchOutcome::Failed(credential.clone())
    } else if errors.iter().any(DataError::is_rate_limited) {
        info!(%symbol, "rate limit outlasted retries, skipping symbol this pass");
        FetchOutcome::Skipped
    } else {
        let error = errors
            .pop()
            .unwrap_or_else(|| DataError::NoContracts(symbol.instrument_key.to_string()));
        warn!(%symbol, %error, "symbol failed");
        FetchOutcome::Failed(error)
    };

    SymbolReport {
        symbol: symbol.name.clone(),
        outcome,
        rate_limit_hits,
    }
}
