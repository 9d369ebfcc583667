use std::time::Duration;

use serde::Deserialize;

/// Short-lived bearer credential scoped to one downstream endpoint. A token
/// minted for one audience must never be presented to another.
#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
}

#[derive(Debug)]
pub enum BrokerError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Timeout => write!(f, "broker request timed out"),
            BrokerError::Http(err) => write!(f, "broker HTTP error: {}", err),
            BrokerError::BadStatus(status) => write!(f, "broker returned status {}", status),
            BrokerError::InvalidResponse => write!(f, "broker returned invalid JSON response"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<reqwest::Error> for BrokerError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            BrokerError::Timeout
        } else {
            BrokerError::Http(value)
        }
    }
}

impl BrokerError {
    /// Acquisition failures worth one more attempt: timeouts, transport
    /// errors, and broker-side 5xx. A 4xx means the request itself is wrong
    /// and retrying cannot help.
    fn is_transient(&self) -> bool {
        match self {
            BrokerError::Timeout => true,
            BrokerError::Http(_) => true,
            BrokerError::BadStatus(status) => status.is_server_error(),
            BrokerError::InvalidResponse => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_backoff: Duration,
}

#[derive(Clone)]
pub struct BrokerClient {
    base_url: String,
    http: reqwest::Client,
    retry_max_attempts: u32,
    retry_base_backoff: Duration,
}

impl BrokerClient {
    pub fn new(config: BrokerClientConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(BrokerError::Http)?;

        Ok(Self {
            base_url: config.base_url,
            http,
            retry_max_attempts: config.retry_max_attempts,
            retry_base_backoff: config.retry_base_backoff,
        })
    }

    /// Requests one audience-scoped token. Called once per outbound
    /// warehouse call; the client never caches tokens. Transient failures
    /// retry a bounded number of times with exponential backoff before
    /// surfacing as a broker error.
    pub async fn token_for(&self, audience: &str) -> Result<Token, BrokerError> {
        let mut attempt = 0u32;
        loop {
            match self.request_token(audience).await {
                Ok(token) => return Ok(token),
                Err(err) if err.is_transient() && attempt < self.retry_max_attempts => {
                    let backoff = self.retry_base_backoff * 2u32.saturating_pow(attempt);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn request_token(&self, audience: &str) -> Result<Token, BrokerError> {
        let resp = self
            .http
            .post(self.token_url())
            .json(&serde_json::json!({ "audience": audience }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BrokerError::BadStatus(resp.status()));
        }

        let token = resp
            .json::<Token>()
            .await
            .map_err(|_| BrokerError::InvalidResponse)?;

        if token.access_token.trim().is_empty() {
            return Err(BrokerError::InvalidResponse);
        }

        Ok(token)
    }

    pub async fn ready(&self) -> Result<(), BrokerError> {
        let resp = self
            .http
            .get(format!("{}/healthz", self.base_url.trim_end_matches('/')))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BrokerError::BadStatus(resp.status()));
        }
        Ok(())
    }

    fn token_url(&self) -> String {
        format!("{}/v1/token", self.base_url.trim_end_matches('/'))
    }
}
