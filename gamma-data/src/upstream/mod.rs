use crate::{chain::StrikeRecord, credential::Credential, error::DataError};
use async_trait::async_trait;
use chrono::NaiveDate;

/// Upstox v2 REST client.
pub mod upstox;

/// Option market-data endpoints consumed by the engine.
///
/// The credential is supplied per call so a refreshed token takes effect on the next
/// attempt without rebuilding the client.
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    /// Every listed contract expiry for the underlying, in upstream order.
    async fn expiries(
        &self,
        credential: &Credential,
        instrument_key: &str,
    ) -> Result<Vec<NaiveDate>, DataError>;

    async fn option_chain(
        &self,
        credential: &Credential,
        instrument_key: &str,
        expiry: NaiveDate,
    ) -> Result<Vec<StrikeRecord>, DataError>;
}
