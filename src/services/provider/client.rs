use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, COOKIE, ORIGIN, REFERER};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::Config;
use crate::error::{is_session_expired_payload, FetchError};
use crate::models::SessionArtifact;
use crate::services::metrics;

pub const API_BASE: &str = "https://api.cld.dtvce.com";

/// Provider endpoints the pipeline calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    AllChannels,
    Schedule,
    Playback,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::AllChannels => "/discovery/metadata/channel/v5/service/allchannels",
            Endpoint::Schedule => "/discovery/edge/schedule/v1/service/schedule",
            Endpoint::Playback => "/right/authorization/channel/v1",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Endpoint::AllChannels => "allchannels",
            Endpoint::Schedule => "schedule",
            Endpoint::Playback => "playback",
        }
    }
}

/// Authenticated JSON GET against the provider
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn get_json(
        &self,
        session: &SessionArtifact,
        endpoint: Endpoint,
        query: &[(String, String)],
    ) -> Result<Value, FetchError>;
}

/// Exponential backoff with up to 25% jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        let exp = self.base.saturating_mul(factor).min(self.cap);
        let jitter_ms = exp.as_millis() as f64 * 0.25;
        let jitter = if jitter_ms > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter_ms)
        } else {
            0.0
        };
        exp + Duration::from_millis(jitter as u64)
    }
}

pub struct HttpProviderApi {
    client: reqwest::Client,
    base_url: String,
    host: String,
    retry: RetryPolicy,
}

impl HttpProviderApi {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        Self::with_base_url(
            API_BASE,
            &config.user_agent,
            Duration::from_secs(config.fetch_timeout_secs),
            RetryPolicy {
                max_retries: config.max_retries,
                base: Duration::from_millis(config.retry_backoff_ms),
                cap: Duration::from_secs(20),
            },
        )
    }

    pub fn with_base_url(
        base_url: &str,
        user_agent: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(ORIGIN, HeaderValue::from_static("https://stream.directv.com"));
        headers.insert(REFERER, HeaderValue::from_static("https://stream.directv.com/"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .build()
            .map_err(|e| FetchError::Network(format!("client build failed: {}", e)))?;

        let host = url::Url::parse(base_url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            host,
            retry,
        })
    }

    fn request(
        &self,
        session: &SessionArtifact,
        endpoint: Endpoint,
        query: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(format!("{}{}", self.base_url, endpoint.path()))
            .query(query)
            .header(AUTHORIZATION, format!("Bearer {}", session.authorization));
        if let Some(cookies) = session.cookie_header(&self.host) {
            req = req.header(COOKIE, cookies);
        }
        req
    }

    async fn attempt(
        &self,
        session: &SessionArtifact,
        endpoint: Endpoint,
        query: &[(String, String)],
    ) -> Result<Value, FetchError> {
        let resp = self.request(session, endpoint, query).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;

        if status == 401 || status == 403 {
            return Err(FetchError::Unauthorized(status));
        }

        let parsed = serde_json::from_str::<Value>(&body);
        if let Ok(value) = &parsed {
            if is_session_expired_payload(value) {
                return Err(FetchError::Unauthorized(status));
            }
        }

        if !(200..300).contains(&status) {
            let snippet: String = body.chars().take(300).collect();
            return Err(FetchError::Http {
                status,
                body: snippet.replace('\n', " ").trim().to_string(),
            });
        }

        parsed.map_err(|e| FetchError::Parse(format!("{}: {}", endpoint.label(), e)))
    }
}

#[async_trait]
impl ProviderApi for HttpProviderApi {
    async fn get_json(
        &self,
        session: &SessionArtifact,
        endpoint: Endpoint,
        query: &[(String, String)],
    ) -> Result<Value, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.attempt(session, endpoint, query).await;

            let retryable = match &result {
                Ok(_) => {
                    metrics::PROVIDER_REQUESTS_TOTAL
                        .with_label_values(&[endpoint.label(), "ok"])
                        .inc();
                    return result;
                }
                Err(FetchError::Network(_)) => true,
                Err(FetchError::Http { status, .. }) => FetchError::is_retryable_status(*status),
                Err(_) => false,
            };

            if !retryable || attempt > self.retry.max_retries {
                metrics::PROVIDER_REQUESTS_TOTAL
                    .with_label_values(&[endpoint.label(), "error"])
                    .inc();
                return result;
            }

            let backoff = self.retry.delay(attempt);
            if let Err(e) = &result {
                tracing::warn!(
                    "fetch_retry" = attempt,
                    "endpoint" = endpoint.label(),
                    "reason" = %e,
                    "backoff_ms" = backoff.as_millis() as u64
                );
            }
            sleep(backoff).await;
        }
    }
}
