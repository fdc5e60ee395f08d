use crate::{
    config::RetryConfig,
    credential::{Credential, CredentialStore},
    error::{DataError, ErrorKind},
};
use chrono::Utc;
use std::{future::Future, time::Duration};
use tracing::warn;

/// What to do after a failed upstream call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetryDecision {
    /// Sleep, then repeat the call.
    Retry(Duration),
    /// Refresh the bearer credential, then repeat the call immediately.
    RefreshCredential,
    GiveUp,
}

/// Backoff policy as a pure function of (error kind, attempt).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RetryPolicy {
    pub rate_limit_retries: u32,
    pub rate_limit_base: Duration,
    pub network_retries: u32,
    pub network_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            rate_limit_retries: config.rate_limit_retries,
            rate_limit_base: Duration::from_secs(config.rate_limit_base_secs),
            network_retries: config.network_retries,
            network_delay: Duration::from_secs(config.network_delay_secs),
        }
    }
}

impl RetryPolicy {
    /// Decide the next step after the 0-based `attempt` of a call failed with `kind`.
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        match kind {
            ErrorKind::RateLimited if attempt < self.rate_limit_retries => {
                RetryDecision::Retry(self.rate_limit_base.saturating_mul(1 << attempt.min(16)))
            }
            ErrorKind::Network if attempt < self.network_retries => {
                RetryDecision::Retry(self.network_delay)
            }
            // Only the first credential failure earns a refresh and a single repeat
            ErrorKind::CredentialExpired if attempt == 0 => RetryDecision::RefreshCredential,
            _ => RetryDecision::GiveUp,
        }
    }

    /// Run `operation` under this policy.
    ///
    /// Each attempt is preceded by `spacing` and uses a credential refreshed ahead of time
    /// when its expiry has passed. Attempts are counted per error kind, so a network blip
    /// does not consume the credential refresh.
    pub async fn execute<T, F, Fut>(
        &self,
        credentials: &CredentialStore,
        spacing: Duration,
        label: &str,
        mut operation: F,
    ) -> Attempted<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let mut rate_limit_hits = 0;
        let mut network_failures = 0;
        let mut credential_failures = 0;

        loop {
            if !spacing.is_zero() {
                tokio::time::sleep(spacing).await;
            }

            let credential = credentials.usable(Utc::now()).await;
            let error = match operation(credential).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        rate_limit_hits,
                    };
                }
                Err(error) => error,
            };

            let kind = error.kind();
            let attempt = match kind {
                ErrorKind::RateLimited => &mut rate_limit_hits,
                ErrorKind::Network => &mut network_failures,
                ErrorKind::CredentialExpired => &mut credential_failures,
                _ => {
                    return Attempted {
                        result: Err(error),
                        rate_limit_hits,
                    };
                }
            };
            let decision = self.decide(kind, *attempt);
            *attempt += 1;

            match decision {
                RetryDecision::Retry(delay) => {
                    warn!(%label, ?kind, attempt = *attempt, ?delay, %error, "retrying upstream call");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::RefreshCredential => {
                    warn!(%label, %error, "credential rejected, refreshing");
                    if let Err(refresh_error) = credentials.refresh().await {
                        warn!(%label, %refresh_error, "credential refresh failed");
                        return Attempted {
                            result: Err(error),
                            rate_limit_hits,
                        };
                    }
                }
                RetryDecision::GiveUp => {
                    return Attempted {
                        result: Err(error),
                        rate_limit_hits,
                    };
                }
            }
        }
    }
}

/// Result of [`RetryPolicy::execute`] along with the rate-limit responses seen on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub result: Result<T, DataError>,
    pub rate_limit_hits: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::tests::StaticRefresher;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn credentials() -> CredentialStore {
        CredentialStore::new(
            Credential::new("stale"),
            Arc::new(StaticRefresher(Credential::new("fresh"))),
        )
    }

    /// Replays `script` one entry per call and records the token each call saw.
    fn scripted(
        script: Vec<Result<u32, DataError>>,
    ) -> (
        Arc<Mutex<Vec<String>>>,
        impl FnMut(Credential) -> std::future::Ready<Result<u32, DataError>>,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut script = script.into_iter();
        let recorder = Arc::clone(&seen);
        let operation = move |credential: Credential| {
            recorder.lock().push(credential.access_token);
            std::future::ready(
                script
                    .next()
                    .unwrap_or_else(|| Err(DataError::Network("script exhausted".to_string()))),
            )
        };
        (seen, operation)
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_rate_limit_exponential_delay() {
        let (seen, operation) = scripted(vec![
            Err(DataError::RateLimited("UDAPI10005".to_string())),
            Err(DataError::RateLimited("UDAPI10005".to_string())),
            Ok(7),
        ]);

        let start = Instant::now();
        let actual = RetryPolicy::default()
            .execute(&credentials(), Duration::ZERO, "NIFTY", operation)
            .await;

        assert_eq!(actual.result, Ok(7));
        assert_eq!(actual.rate_limit_hits, 2);
        assert_eq!(seen.lock().len(), 3);
        // 5s then 10s
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_rate_limit_exhausted() {
        let (seen, operation) = scripted(vec![
            Err(DataError::RateLimited("UDAPI10005".to_string())),
            Err(DataError::RateLimited("UDAPI10005".to_string())),
            Err(DataError::RateLimited("UDAPI10005".to_string())),
            Ok(1),
        ]);

        let actual = RetryPolicy::default()
            .execute(&credentials(), Duration::ZERO, "NIFTY", operation)
            .await;

        assert!(matches!(actual.result, Err(DataError::RateLimited(_))));
        assert_eq!(actual.rate_limit_hits, 3);
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_refreshes_credential_then_retries_once() {
        let (seen, operation) = scripted(vec![
            Err(DataError::CredentialExpired("UDAPI100050".to_string())),
            Ok(3),
        ]);
        let credentials = credentials();

        let actual = RetryPolicy::default()
            .execute(&credentials, Duration::from_millis(200), "NIFTY", operation)
            .await;

        assert_eq!(actual.result, Ok(3));
        assert_eq!(*seen.lock(), vec!["stale".to_string(), "fresh".to_string()]);
        assert_eq!(credentials.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_refreshes_past_expiry_before_calling() {
        let (seen, operation) = scripted(vec![Ok(4)]);
        let credentials = CredentialStore::new(
            Credential {
                access_token: "stale".to_string(),
                expires_at: Some(Utc::now() - chrono::TimeDelta::minutes(1)),
            },
            Arc::new(StaticRefresher(Credential::new("fresh"))),
        );

        let actual = RetryPolicy::default()
            .execute(&credentials, Duration::ZERO, "NIFTY", operation)
            .await;

        assert_eq!(actual.result, Ok(4));
        assert_eq!(*seen.lock(), vec!["fresh".to_string()]);
        assert_eq!(credentials.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_domain_error_fails_fast() {
        let (seen, operation) = scripted(vec![
            Err(DataError::NoContracts("NSE_EQ|INE000".to_string())),
            Ok(1),
        ]);

        let actual = RetryPolicy::default()
            .execute(&credentials(), Duration::ZERO, "XYZ", operation)
            .await;

        assert!(matches!(actual.result, Err(DataError::NoContracts(_))));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_retry_policy_decide() {
        struct TestCase {
            kind: ErrorKind,
            attempt: u32,
            expected: RetryDecision,
        }

        let policy = RetryPolicy::default();

        let tests = vec![
            TestCase {
                // TC0: first rate-limit retry waits the base
                kind: ErrorKind::RateLimited,
                attempt: 0,
                expected: RetryDecision::Retry(Duration::from_secs(5)),
            },
            TestCase {
                // TC1: second rate-limit retry doubles
                kind: ErrorKind::RateLimited,
                attempt: 1,
                expected: RetryDecision::Retry(Duration::from_secs(10)),
            },
            TestCase {
                // TC2: rate-limit retries exhausted
                kind: ErrorKind::RateLimited,
                attempt: 2,
                expected: RetryDecision::GiveUp,
            },
            TestCase {
                // TC3: network delay is constant
                kind: ErrorKind::Network,
                attempt: 1,
                expected: RetryDecision::Retry(Duration::from_secs(5)),
            },
            TestCase {
                // TC4: network retries exhausted
                kind: ErrorKind::Network,
                attempt: 2,
                expected: RetryDecision::GiveUp,
            },
            TestCase {
                // TC5: credential refreshed once
                kind: ErrorKind::CredentialExpired,
                attempt: 0,
                expected: RetryDecision::RefreshCredential,
            },
            TestCase {
                // TC6: credential failure after refresh surfaces
                kind: ErrorKind::CredentialExpired,
                attempt: 1,
                expected: RetryDecision::GiveUp,
            },
            TestCase {
                // TC7: domain errors fail fast
                kind: ErrorKind::Domain,
                attempt: 0,
                expected: RetryDecision::GiveUp,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = policy.decide(test.kind, test.attempt);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
