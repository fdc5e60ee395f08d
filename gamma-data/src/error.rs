use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upstox error code returned when the request rate limit is exceeded.
pub const RATE_LIMIT_ERROR_CODE: &str = "UDAPI10005";

/// Upstox error code returned when the bearer token is invalid or expired.
pub const INVALID_TOKEN_ERROR_CODE: &str = "UDAPI100050";

/// All errors generated in `gamma-data`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("upstream rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("bearer credential rejected or missing: {0}")]
    CredentialExpired(String),

    #[error("upstream rejected request with code {code}: {message}")]
    Upstream { code: String, message: String },

    #[error("no option contracts available for instrument: {0}")]
    NoContracts(String),

    #[error("failed to decode upstream payload: {0}")]
    Decode(String),

    #[error("snapshot store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load symbol universe: {0}")]
    Universe(String),
}

/// Closed classification of a [`DataError`] used by the retry policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum ErrorKind {
    RateLimited,
    Network,
    CredentialExpired,
    Domain,
    Store,
}

/// Coarse classification of a failed scheduling pass, used for failure budgets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum FailureClass {
    Credential,
    Network,
    Other,
}

impl DataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::RateLimited(_) => ErrorKind::RateLimited,
            DataError::Network(_) => ErrorKind::Network,
            DataError::CredentialExpired(_) => ErrorKind::CredentialExpired,
            DataError::StoreUnavailable(_) => ErrorKind::Store,
            DataError::Upstream { .. }
            | DataError::NoContracts(_)
            | DataError::Decode(_)
            | DataError::Config(_)
            | DataError::Universe(_) => ErrorKind::Domain,
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self.kind() {
            ErrorKind::CredentialExpired => FailureClass::Credential,
            ErrorKind::Network => FailureClass::Network,
            _ => FailureClass::Other,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DataError::RateLimited(_))
    }

    /// Classify a structured upstream error body.
    ///
    /// Rate-limit and token codes are recognised regardless of the HTTP status the
    /// upstream chose to send them with.
    pub fn from_upstream(status: u16, code: &str, message: &str) -> Self {
        let message_lower = message.to_lowercase();

        if status == 429
            || code == RATE_LIMIT_ERROR_CODE
            || message_lower.contains("too many request")
        {
            DataError::RateLimited(format!("{code}: {message}"))
        } else if status == 401 || code == INVALID_TOKEN_ERROR_CODE {
            DataError::CredentialExpired(format!("{code}: {message}"))
        } else {
            DataError::Upstream {
                code: code.to_string(),
                message: message.to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for DataError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            DataError::Decode(error.to_string())
        } else if error.is_timeout() || error.is_connect() || error.is_request() {
            DataError::Network(error.to_string())
        } else if let Some(status) = error.status() {
            DataError::from_upstream(status.as_u16(), "", &error.to_string())
        } else {
            DataError::Network(error.to_string())
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(error: serde_json::Error) -> Self {
        DataError::Decode(error.to_string())
    }
}
