use super::MarketDataApi;
use crate::{
    chain::StrikeRecord, config::UpstreamConfig, credential::Credential, error::DataError,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, header::ACCEPT};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

/// Upper bound of raw body text carried into an error message.
const ERROR_BODY_PREVIEW: usize = 256;

/// Upstox response envelope, eg/ `{"status":"success","data":[...]}`.
#[derive(Debug, Deserialize)]
struct UpstoxResponse<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    errors: Vec<UpstoxErrorBody>,
}

/// Upstox sends the error code in both snake and camel case.
#[derive(Debug, Default, Deserialize)]
struct UpstoxErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default, rename = "errorCode")]
    error_code_camel: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl UpstoxErrorBody {
    fn code(&self) -> &str {
        self.error_code
            .as_deref()
            .or(self.error_code_camel.as_deref())
            .unwrap_or_default()
    }
}

/// One listed option contract. Only the expiry is consumed.
#[derive(Debug, Deserialize)]
struct UpstoxContract {
    expiry: NaiveDate,
}

/// Decode an Upstox body into `T`, classifying structured error bodies.
fn decode_response<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, DataError> {
    let success = (200..300).contains(&status);

    let envelope = match serde_json::from_slice::<UpstoxResponse<T>>(body) {
        Ok(envelope) => envelope,
        Err(error) if success => return Err(DataError::from(error)),
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let preview = text.chars().take(ERROR_BODY_PREVIEW).collect::<String>();
            return Err(DataError::from_upstream(status, "", &preview));
        }
    };

    if success && envelope.status == "success" {
        return envelope.data.ok_or_else(|| {
            DataError::Decode("success response without a data field".to_string())
        });
    }

    let error = envelope.errors.into_iter().next().unwrap_or_default();
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| format!("status {}", envelope.status));
    Err(DataError::from_upstream(status, error.code(), &message))
}

/// [`MarketDataApi`] implementation for the Upstox v2 REST API.
#[derive(Debug, Clone)]
pub struct UpstoxClient {
    http: Client,
    base_url: String,
}

impl UpstoxClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, DataError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|error| DataError::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, DataError> {
        Url::parse_with_params(&format!("{}/{path}", self.base_url), params)
            .map_err(|error| DataError::Config(format!("invalid upstream url: {error}")))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: Url,
    ) -> Result<T, DataError> {
        debug!(%url, "upstream request");

        let response = self
            .http
            .get(url)
            .bearer_auth(&credential.access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        decode_response(status, &body)
    }
}

#[async_trait]
impl MarketDataApi for UpstoxClient {
    async fn expiries(
        &self,
        credential: &Credential,
        instrument_key: &str,
    ) -> Result<Vec<NaiveDate>, DataError> {
        let url = self.endpoint("option/contract", &[("instrument_key", instrument_key)])?;
        let contracts = self.get::<Vec<UpstoxContract>>(credential, url).await?;

        Ok(contracts.into_iter().map(|contract| contract.expiry).collect())
    }

    async fn option_chain(
        &self,
        credential: &Credential,
        instrument_key: &str,
        expiry: NaiveDate,
    ) -> Result<Vec<StrikeRecord>, DataError> {
        let expiry_date = expiry.format("%Y-%m-%d").to_string();
        let url = self.endpoint(
            "option/chain",
            &[("instrument_key", instrument_key), ("expiry_date", &expiry_date)],
        )?;

        self.get::<Vec<StrikeRecord>>(credential, url).await
    }
}
