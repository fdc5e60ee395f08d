use crate::error::DataError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{info, warn};

/// Bearer token used to authenticate upstream calls.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

// Never log the token itself
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of a still-valid or refreshed [`Credential`].
#[async_trait]
pub trait CredentialRefresh: Send + Sync {
    async fn refresh(&self, current: &Credential) -> Result<Credential, DataError>;
}

/// Re-reads the JSON token file maintained by the external OAuth flow.
#[derive(Debug, Clone)]
pub struct TokenFileRefresher {
    pub path: PathBuf,
}

impl TokenFileRefresher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn read(&self) -> Result<Credential, DataError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|error| {
            DataError::CredentialExpired(format!(
                "failed to read token file {}: {error}",
                self.path.display()
            ))
        })?;

        let credential = serde_json::from_str::<Credential>(&contents)?;
        if credential.access_token.trim().is_empty() {
            return Err(DataError::CredentialExpired(format!(
                "token file {} has no access_token",
                self.path.display()
            )));
        }
        Ok(credential)
    }
}

#[async_trait]
impl CredentialRefresh for TokenFileRefresher {
    async fn refresh(&self, current: &Credential) -> Result<Credential, DataError> {
        let credential = self.read().await?;
        if credential == *current {
            warn!(path = %self.path.display(), "token file unchanged since last refresh");
        }
        Ok(credential)
    }
}

/// Re-reads a bearer token from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvTokenRefresher {
    pub var: String,
}

/// Environment variable carrying the initial bearer token.
pub const ACCESS_TOKEN_VAR: &str = "UPSTOX_ACCESS_TOKEN";

impl Default for EnvTokenRefresher {
    fn default() -> Self {
        Self {
            var: ACCESS_TOKEN_VAR.to_string(),
        }
    }
}

impl EnvTokenRefresher {
    pub fn read(&self) -> Result<Credential, DataError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(Credential::new(token.trim())),
            _ => Err(DataError::CredentialExpired(format!("{} is not set", self.var))),
        }
    }
}

#[async_trait]
impl CredentialRefresh for EnvTokenRefresher {
    async fn refresh(&self, _: &Credential) -> Result<Credential, DataError> {
        self.read()
    }
}

/// Shared holder of the active bearer credential.
#[derive(Clone)]
pub struct CredentialStore {
    current: Arc<RwLock<Credential>>,
    refresher: Arc<dyn CredentialRefresh>,
    refreshes: Arc<AtomicU64>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("current", &*self.current.read())
            .field("refreshes", &self.refreshes.load(Ordering::Relaxed))
            .finish()
    }
}

impl CredentialStore {
    pub fn new(initial: Credential, refresher: Arc<dyn CredentialRefresh>) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
            refresher,
            refreshes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current(&self) -> Credential {
        self.current.read().clone()
    }

    pub fn replace(&self, credential: Credential) {
        *self.current.write() = credential;
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Current credential, refreshed first when its expiry has passed.
    ///
    /// A failed refresh hands back the expired credential and leaves the verdict to the
    /// upstream.
    pub async fn usable(&self, now: DateTime<Utc>) -> Credential {
        let current = self.current();
        if !current.is_expired(now) {
            return current;
        }

        warn!(expires_at = ?current.expires_at, "bearer credential past expiry, refreshing");
        match self.refresh().await {
            Ok(refreshed) => refreshed,
            Err(error) => {
                warn!(%error, "proactive credential refresh failed");
                current
            }
        }
    }

    /// Ask the refresher for a valid credential and swap it in.
    pub async fn refresh(&self) -> Result<Credential, DataError> {
        let current = self.current();
        let refreshed = self.refresher.refresh(&current).await?;

        self.replace(refreshed.clone());
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(expires_at = ?refreshed.expires_at, "bearer credential refreshed");

        Ok(refreshed)
    }
}
