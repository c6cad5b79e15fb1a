//! Resilient HTTP request execution shared by all provider adapters
//!
//! Every provider call goes through [`RequestExecutor`], which maps HTTP
//! statuses onto [`TernError`] and retries throttled or failed requests with
//! exponential backoff. Waiting is delegated to a [`Sleeper`] so tests can
//! observe delays without sleeping.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{TernError, TernResult};

/// 403 bodies containing one of these are quota errors, not permission errors
const QUOTA_ERROR_PATTERNS: &[&str] = &[
    "ratelimitexceeded",
    "userratelimitexceeded",
    "quotaexceeded",
    "too many requests",
];

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Something that can wait
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled each time
    pub base_delay: Duration,
    /// Cap applied to every delay, including server-provided ones
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(config.retry_base_delay),
            max_delay: Duration::from_secs(config.retry_max_delay),
        }
    }

    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Classification of a failed attempt
enum Attempt {
    Retry {
        after: Option<Duration>,
        reason: String,
    },
    Fail(TernError),
}

/// Executes provider requests with status mapping and retries
#[derive(Clone)]
pub struct RequestExecutor {
    client: reqwest::Client,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RequestExecutor {
    pub fn new(client: reqwest::Client, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            client,
            policy,
            sleeper,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Wait on the executor's sleeper, for adapters that poll
    pub async fn pause(&self, duration: Duration) {
        self.sleeper.sleep(duration).await;
    }

    /// Send a request, rebuilding it for every attempt.
    ///
    /// Returns the first successful response. 401, 403, 404, 410 and other
    /// 4xx responses fail immediately; 429, quota 403s, 5xx and transport
    /// errors are retried until the budget runs out.
    pub async fn send<F>(&self, build: F) -> TernResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;

        loop {
            let outcome = match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => classify_response(response).await,
                Err(e) if e.is_builder() => return Err(e.into()),
                Err(e) => Attempt::Retry {
                    after: None,
                    reason: format!("transport error: {}", e),
                },
            };

            match outcome {
                Attempt::Fail(err) => return Err(err),
                Attempt::Retry { after, reason } => {
                    if attempt >= self.policy.max_retries {
                        return Err(TernError::unavailable(format!(
                            "{} (gave up after {} attempts)",
                            reason,
                            attempt + 1
                        )));
                    }

                    let delay = after
                        .unwrap_or_else(|| self.policy.backoff(attempt))
                        .min(self.policy.max_delay);
                    warn!(
                        "Provider request failed: {}. Retrying in {:?} (attempt {}/{})",
                        reason,
                        delay,
                        attempt + 1,
                        self.policy.max_retries + 1
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// GET a JSON document with a bearer token
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> TernResult<T> {
        debug!("GET {}", url);
        let response = self
            .send(|| self.client.get(url).bearer_auth(token).query(query))
            .await?;
        Ok(response.json::<T>().await?)
    }

    /// POST a JSON body with a bearer token and decode the JSON reply
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        body: &B,
    ) -> TernResult<T> {
        debug!("POST {}", url);
        let response = self
            .send(|| self.client.post(url).bearer_auth(token).json(body))
            .await?;
        Ok(response.json::<T>().await?)
    }

    /// POST a JSON body when the reply carries no content
    pub async fn post_no_content<B: Serialize + ?Sized>(&self, url: &str, token: &str, body: &B) -> TernResult<()> {
        debug!("POST {}", url);
        self.send(|| self.client.post(url).bearer_auth(token).json(body))
            .await?;
        Ok(())
    }
}

async fn classify_response(response: reqwest::Response) -> Attempt {
    let status = response.status();
    let header_delay = retry_after_header(&response);
    let body = response.text().await.unwrap_or_default();
    let message = truncate(&body);

    match status.as_u16() {
        429 => Attempt::Retry {
            after: header_delay.or_else(|| parse_retry_after_message(&body, OffsetDateTime::now_utc())),
            reason: "rate limited (429)".to_string(),
        },
        401 => Attempt::Fail(TernError::auth_expired(format!("401 Unauthorized: {}", message))),
        403 if is_quota_error(&body) => Attempt::Retry {
            after: header_delay.or_else(|| parse_retry_after_message(&body, OffsetDateTime::now_utc())),
            reason: "quota exceeded (403)".to_string(),
        },
        403 => Attempt::Fail(TernError::PermissionDenied(message)),
        404 => Attempt::Fail(TernError::not_found(message)),
        410 => Attempt::Fail(TernError::CursorExpired(message)),
        code if status.is_server_error() => Attempt::Retry {
            after: header_delay,
            reason: format!("server error ({})", code),
        },
        code => Attempt::Fail(TernError::ProviderRequest { status: code, message }),
    }
}

fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: f64 = value.trim().parse().ok()?;
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    // Out of range values saturate and are capped by the retry policy
    Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

fn is_quota_error(body: &str) -> bool {
    let body = body.to_lowercase();
    QUOTA_ERROR_PATTERNS.iter().any(|pattern| body.contains(pattern))
}

/// Parse Gmail's `Retry after 2025-12-01T13:51:52.950Z` error text.
///
/// Returns at least one second so a timestamp in the past still backs off.
pub fn parse_retry_after_message(body: &str, now: OffsetDateTime) -> Option<Duration> {
    let start = body.find("Retry after ")? + "Retry after ".len();
    let timestamp: String = body[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '"' && *c != ',')
        .collect();
    let retry_at = OffsetDateTime::parse(&timestamp, &Rfc3339).ok()?;

    let wait = (retry_at - now).whole_milliseconds().max(0) as u64;
    let seconds = ((wait + 999) / 1000).max(1);
    Some(Duration::from_secs(seconds))
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
