use crate::{
    calendar::MarketCalendar,
    credential::CredentialStore,
    error::DataError,
    instrument::Symbol,
    policy::RetryPolicy,
    upstream::MarketDataApi,
};
use chrono::{DateTime, NaiveDate, Utc};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
struct CacheEntry {
    expiries: Vec<NaiveDate>,
    valid_until: DateTime<Utc>,
}

/// Per trading day cache of resolved expiries keyed by (symbol, instrument key).
#[derive(Debug, Default)]
pub struct ExpiryCache {
    entries: RwLock<FnvHashMap<(SmolStr, SmolStr), CacheEntry>>,
}

impl ExpiryCache {
    fn key(symbol: &Symbol) -> (SmolStr, SmolStr) {
        (symbol.name.clone(), symbol.instrument_key.clone())
    }

    /// Cached expiries if the entry has not passed its validity boundary.
    pub fn get(&self, symbol: &Symbol, now: DateTime<Utc>) -> Option<Vec<NaiveDate>> {
        self.entries
            .read()
            .get(&Self::key(symbol))
            .filter(|entry| now < entry.valid_until)
            .map(|entry| entry.expiries.clone())
    }

    /// Cached expiries regardless of validity, used as a last resort.
    pub fn get_stale(&self, symbol: &Symbol) -> Option<Vec<NaiveDate>> {
        self.entries
            .read()
            .get(&Self::key(symbol))
            .map(|entry| entry.expiries.clone())
    }

    pub fn insert(&self, symbol: &Symbol, expiries: Vec<NaiveDate>, valid_until: DateTime<Utc>) {
        self.entries.write().insert(
            Self::key(symbol),
            CacheEntry {
                expiries,
                valid_until,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Ascending, de-duplicated expiries on or after `today`, truncated to `max_count`.
pub fn select_expiries(listed: &[NaiveDate], today: NaiveDate, max_count: usize) -> Vec<NaiveDate> {
    listed
        .iter()
        .copied()
        .filter(|expiry| *expiry >= today)
        .sorted()
        .dedup()
        .take(max_count)
        .collect()
}

/// Resolves the nearest contract expiries of a symbol through [`ExpiryCache`].
#[derive(Clone)]
pub struct ExpiryResolver {
    api: Arc<dyn MarketDataApi>,
    credentials: CredentialStore,
    calendar: MarketCalendar,
    policy: RetryPolicy,
    spacing: Duration,
    cache: Arc<ExpiryCache>,
}

impl std::fmt::Debug for ExpiryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryResolver")
            .field("calendar", &self.calendar)
            .field("policy", &self.policy)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Expiries plus the number of rate-limit responses met while resolving them.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub expiries: Vec<NaiveDate>,
    pub rate_limit_hits: u32,
}

impl ExpiryResolver {
    pub fn new(
        api: Arc<dyn MarketDataApi>,
        credentials: CredentialStore,
        calendar: MarketCalendar,
        policy: RetryPolicy,
        spacing: Duration,
        cache: Arc<ExpiryCache>,
    ) -> Self {
        Self {
            api,
            credentials,
            calendar,
            policy,
            spacing,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ExpiryCache> {
        &self.cache
    }

    /// Resolve up to `max_count` expiries for `symbol` as of `now`.
    ///
    /// An upstream failure falls back to the last cached value even if stale; without one
    /// the failure is returned.
    pub async fn resolve(
        &self,
        symbol: &Symbol,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Resolved, DataError> {
        let today = self.calendar.local_date(now);

        if let Some(cached) = self.cache.get(symbol, now) {
            debug!(%symbol, "expiry cache hit");
            return Ok(Resolved {
                expiries: select_expiries(&cached, today, max_count),
                rate_limit_hits: 0,
            });
        }

        let api = Arc::clone(&self.api);
        let instrument_key = symbol.instrument_key.clone();
        let attempted = self
            .policy
            .execute(&self.credentials, self.spacing, &symbol.name, move |credential| {
                let api = Arc::clone(&api);
                let instrument_key = instrument_key.clone();
                async move { api.expiries(&credential, &instrument_key).await }
            })
            .await;

        let result = attempted.result.and_then(|listed| {
            let upcoming = select_expiries(&listed, today, usize::MAX);
            if upcoming.is_empty() {
                Err(DataError::NoContracts(symbol.instrument_key.to_string()))
            } else {
                Ok(upcoming)
            }
        });

        match result {
            Ok(upcoming) => {
                self.cache
                    .insert(symbol, upcoming.clone(), self.calendar.valid_until(now));
                Ok(Resolved {
                    expiries: upcoming.into_iter().take(max_count).collect(),
                    rate_limit_hits: attempted.rate_limit_hits,
                })
            }
            Err(error) => match self.cache.get_stale(symbol) {
                Some(stale) => {
                    warn!(%symbol, %error, "expiry lookup failed, using stale cache entry");
                    Ok(Resolved {
                        expiries: select_expiries(&stale, today, max_count),
                        rate_limit_hits: attempted.rate_limit_hits,
                    })
                }
                None => Err(error),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        chain::StrikeRecord,
        credential::{Credential, tests::StaticRefresher},
    };
    use async_trait::async_trait;
    use chrono::{NaiveDateTime, TimeZone};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Upstream double answering expiry lookups from a queue.
    #[derive(Default)]
    pub(crate) struct ExpiryApi {
        pub responses: Mutex<VecDeque<Result<Vec<NaiveDate>, DataError>>>,
        pub calls: Mutex<u32>,
    }

    #[async_trait]
    impl MarketDataApi for ExpiryApi {
        async fn expiries(
            &self,
            _: &Credential,
            _: &str,
        ) -> Result<Vec<NaiveDate>, DataError> {
            *self.calls.lock() += 1;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(DataError::Network("no scripted response".to_string())))
        }

        async fn option_chain(
            &self,
            _: &Credential,
            _: &str,
            _: NaiveDate,
        ) -> Result<Vec<StrikeRecord>, DataError> {
            Ok(vec![])
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn ist(input: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M").unwrap();
        chrono_tz::Asia::Kolkata
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn resolver(api: Arc<ExpiryApi>) -> ExpiryResolver {
        ExpiryResolver::new(
            api,
            CredentialStore::new(
                Credential::new("token"),
                Arc::new(StaticRefresher(Credential::new("token"))),
            ),
            MarketCalendar::default(),
            RetryPolicy::default(),
            Duration::ZERO,
            Arc::new(ExpiryCache::default()),
        )
    }

    #[test]
    fn test_select_expiries() {
        struct TestCase {
            listed: Vec<NaiveDate>,
            max_count: usize,
            expected: Vec<NaiveDate>,
        }

        let tests = vec![
            TestCase {
                // TC0: unordered with duplicates, truncated
                listed: vec![date(30), date(23), date(30), date(16)],
                max_count: 2,
                expected: vec![date(23), date(30)],
            },
            TestCase {
                // TC1: past expiries dropped, today kept
                listed: vec![date(9), date(20)],
                max_count: 2,
                expected: vec![date(20)],
            },
            TestCase {
                // TC2: nothing upcoming
                listed: vec![date(2)],
                max_count: 1,
                expected: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = select_expiries(&test.listed, date(20), test.max_count);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_caches_within_day() {
        let api = Arc::new(ExpiryApi::default());
        api.responses
            .lock()
            .push_back(Ok(vec![date(30), date(23), date(16)]));
        let resolver = resolver(Arc::clone(&api));

        let symbol = Symbol::index("NIFTY", "NSE_INDEX|Nifty 50");

        let first = resolver.resolve(&symbol, 2, ist("2025-01-20 09:20")).await.unwrap();
        let second = resolver.resolve(&symbol, 2, ist("2025-01-20 15:00")).await.unwrap();

        assert_eq!(first.expiries, vec![date(23), date(30)]);
        assert_eq!(second.expiries, first.expiries);
        assert_eq!(*api.calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_day_rollover_refetches() {
        let api = Arc::new(ExpiryApi::default());
        api.responses.lock().extend([
            Ok(vec![date(23), date(30)]),
            Ok(vec![date(23), date(30), date(31)]),
        ]);
        let resolver = resolver(Arc::clone(&api));
        let symbol = Symbol::equity("RELIANCE", "NSE_EQ|INE002A01018");

        resolver.resolve(&symbol, 1, ist("2025-01-22 10:00")).await.unwrap();
        // next trading day, the entry expired at the previous close
        let next_day = resolver.resolve(&symbol, 1, ist("2025-01-23 09:16")).await.unwrap();

        assert_eq!(next_day.expiries, vec![date(23)]);
        assert_eq!(*api.calls.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_falls_back_to_stale_cache_after_rate_limit() {
        let api = Arc::new(ExpiryApi::default());
        api.responses.lock().extend([
            Ok(vec![date(23), date(30)]),
            Err(DataError::RateLimited("UDAPI10005".to_string())),
            Err(DataError::RateLimited("UDAPI10005".to_string())),
            Err(DataError::RateLimited("UDAPI10005".to_string())),
        ]);
        let resolver = resolver(Arc::clone(&api));
        let symbol = Symbol::index("BANKNIFTY", "NSE_INDEX|Nifty Bank");

        resolver.resolve(&symbol, 2, ist("2025-01-21 10:00")).await.unwrap();
        let actual = resolver.resolve(&symbol, 2, ist("2025-01-22 10:00")).await.unwrap();

        assert_eq!(actual.expiries, vec![date(23), date(30)]);
        assert_eq!(actual.rate_limit_hits, 3);
        assert_eq!(*api.calls.lock(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_without_cache_surfaces_error() {
        let api = Arc::new(ExpiryApi::default());
        api.responses
            .lock()
            .push_back(Err(DataError::NoContracts("NSE_EQ|INE000".to_string())));
        let resolver = resolver(Arc::clone(&api));

        let actual = resolver
            .resolve(&Symbol::equity("XYZ", "NSE_EQ|INE000"), 1, ist("2025-01-22 10:00"))
            .await;

        assert!(matches!(actual, Err(DataError::NoContracts(_))));
    }
}
