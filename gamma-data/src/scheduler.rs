use crate::{
    calendar::MarketCalendar,
    config::SchedulerConfig,
    error::{DataError, FailureClass},
    fetcher::Fetcher,
    instrument::{Symbol, SymbolSource},
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, info, warn};

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `true` when the caller should stop.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => match changed {
            Ok(()) => *shutdown.borrow(),
            // Sender dropped, nobody is left to request a shutdown
            Err(_) => {
                tokio::time::sleep(duration).await;
                false
            }
        },
    }
}

/// Next step of a loop after a failed pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailureAction {
    Retry { delay: Duration, refresh: bool },
    Fatal,
}

/// Consecutive failed pass accounting for one cadence loop.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureBudget {
    budget: u32,
    credential_budget: u32,
    backoff: Duration,
    failures: u32,
    credential_failures: u32,
}

impl FailureBudget {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            budget: config.failure_budget,
            credential_budget: config.credential_failure_budget,
            backoff: config.failure_backoff(),
            failures: 0,
            credential_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.credential_failures = 0;
    }

    pub fn record_failure(&mut self, class: FailureClass) -> FailureAction {
        match class {
            FailureClass::Credential => {
                self.credential_failures += 1;
                if self.credential_failures > self.credential_budget {
                    FailureAction::Fatal
                } else {
                    FailureAction::Retry {
                        delay: self.backoff,
                        refresh: true,
                    }
                }
            }
            FailureClass::Network | FailureClass::Other => {
                self.failures += 1;
                if self.failures > self.budget {
                    FailureAction::Fatal
                } else {
                    FailureAction::Retry {
                        delay: self.backoff.saturating_mul(self.failures),
                        refresh: false,
                    }
                }
            }
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn credential_failures(&self) -> u32 {
        self.credential_failures
    }
}

/// One market-hours gated polling loop over a symbol subset.
///
/// The subset is taken from a [`SymbolSource`] at the start of every open pass. A failed
/// reload keeps the previous subset.
#[derive(Debug)]
pub struct CadenceLoop {
    name: &'static str,
    source: SymbolSource,
    cadence: Duration,
    fetcher: Fetcher,
    calendar: MarketCalendar,
    config: SchedulerConfig,
    clock: fn() -> DateTime<Utc>,
}

impl CadenceLoop {
    pub fn new(
        name: &'static str,
        source: SymbolSource,
        cadence: Duration,
        fetcher: Fetcher,
        calendar: MarketCalendar,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            name,
            source,
            cadence,
            fetcher,
            calendar,
            config,
            clock: Utc::now,
        }
    }

    /// Replace the wall clock consulted by the market-hours gate.
    pub fn with_clock(self, clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock, ..self }
    }

    /// Run until shutdown is signalled or the failure budget is exhausted.
    ///
    /// Fails immediately when the first symbol load fails.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), DataError> {
        let mut shutdown = shutdown;
        let mut budget = FailureBudget::new(&self.config);
        let mut symbols = self.source.load().await?;

        if symbols.is_empty() && self.source.is_fixed() {
            info!(cadence_loop = self.name, "no symbols assigned, loop idle");
            return Ok(());
        }

        info!(
            cadence_loop = self.name,
            symbols = symbols.len(),
            cadence = ?self.cadence,
            force = self.config.force,
            "cadence loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.config.force && !self.calendar.is_open((self.clock)()) {
                debug!(cadence_loop = self.name, "market closed");
                if sleep_or_shutdown(self.config.closed_poll(), &mut shutdown).await {
                    break;
                }
                continue;
            }

            self.reload(&mut symbols).await;
            if symbols.is_empty() {
                debug!(cadence_loop = self.name, "no symbols this pass");
                if sleep_or_shutdown(self.cadence, &mut shutdown).await {
                    break;
                }
                continue;
            }

            let started = Instant::now();
            match self.fetcher.run_pass(&symbols, &shutdown).await {
                Ok(report) => {
                    budget.record_success();
                    info!(
                        cadence_loop = self.name,
                        succeeded = report.succeeded,
                        skipped = report.skipped,
                        failed = report.failed,
                        rate_limit_hits = report.rate_limit_hits,
                        elapsed = ?started.elapsed(),
                        health = ?self.fetcher.health().snapshot(),
                        "pass complete"
                    );
                }
                Err(pass_error) => {
                    self.fetcher.health().record_failed_pass();
                    match budget.record_failure(pass_error.failure_class()) {
                        FailureAction::Fatal => {
                            error!(
                                cadence_loop = self.name,
                                %pass_error,
                                failures = budget.failures(),
                                credential_failures = budget.credential_failures(),
                                health = ?self.fetcher.health().snapshot(),
                                "failure budget exhausted, stopping loop"
                            );
                            return Err(pass_error);
                        }
                        FailureAction::Retry { delay, refresh } => {
                            warn!(
                                cadence_loop = self.name,
                                %pass_error,
                                ?delay,
                                refresh,
                                "pass failed"
                            );
                            if refresh {
                                if let Err(refresh_error) =
                                    self.fetcher.credentials().refresh().await
                                {
                                    warn!(cadence_loop = self.name, %refresh_error, "credential refresh failed");
                                }
                            }
                            if sleep_or_shutdown(delay, &mut shutdown).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            }

            let wait = self.cadence.saturating_sub(started.elapsed());
            if sleep_or_shutdown(wait, &mut shutdown).await {
                break;
            }
        }

        info!(
            cadence_loop = self.name,
            health = ?self.fetcher.health().snapshot(),
            "cadence loop stopped"
        );
        Ok(())
    }

    async fn reload(&self, symbols: &mut Vec<Symbol>) {
        if self.source.is_fixed() {
            return;
        }
        match self.source.load().await {
            Ok(reloaded) if reloaded != *symbols => {
                info!(
                    cadence_loop = self.name,
                    previous = symbols.len(),
                    current = reloaded.len(),
                    "symbol set changed"
                );
                *symbols = reloaded;
            }
            Ok(_) => {}
            Err(error) => {
                warn!(cadence_loop = self.name, %error, "symbol reload failed, keeping previous set");
            }
        }
    }
}
