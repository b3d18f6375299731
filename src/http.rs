use std::time::Duration;

use anyhow::Context as _;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};

use crate::config::Config;

/// Statuses that mean "try again later" rather than "no".
pub const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Capped exponential backoff: attempt `i` (zero-based) waits
/// `min(base * 2^i, cap)` unless the server says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRY_STATUSES.contains(&status.as_u16())
}

/// A numeric `Retry-After` header, in seconds. HTTP-date values and numbers
/// no `Duration` can hold (negative, NaN, overflowing) are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Sends `method url`, retrying rate limits, 5xx gateway statuses and
/// transport errors according to `policy`.
///
/// Any response outside [`RETRY_STATUSES`] is returned as-is, including 4xx;
/// callers decide what a 404 means.
pub async fn backoff_request(
    client: &Client,
    policy: &BackoffPolicy,
    method: Method,
    url: &str,
    timeout: Option<Duration>,
) -> anyhow::Result<Response> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_status = None;

    for attempt in 0..max_attempts {
        let is_last = attempt + 1 == max_attempts;
        let mut request = client.request(method.clone(), url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if !is_retryable_status(status) {
                    return Ok(response);
                }
                last_status = Some(status);
                if is_last {
                    break;
                }

                let wait = retry_after(response.headers())
                    .unwrap_or_else(|| policy.delay_for_attempt(attempt));
                tracing::warn!(
                    %url,
                    status = status.as_u16(),
                    wait_secs = wait.as_secs_f64(),
                    attempt = attempt + 1,
                    max_attempts,
                    "retryable status; backing off"
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                if is_last {
                    tracing::error!(%url, ?err, "http request failed");
                    return Err(err).with_context(|| format!("{method} {url}"));
                }

                let wait = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    %url,
                    %err,
                    wait_secs = wait.as_secs_f64(),
                    attempt = attempt + 1,
                    max_attempts,
                    "transport error; backing off"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    let status = last_status
        .ok_or_else(|| anyhow::anyhow!("{method} {url}: retry loop ended without a response"))?;
    tracing::error!(%url, status = status.as_u16(), "giving up after retries");
    anyhow::bail!("{method} {url}: still {status} after {max_attempts} attempts");
}

/// Builds one long-lived session from the `http` and `timeouts` sections.
pub fn build_client(config: &Config) -> anyhow::Result<Client> {
    Client::builder()
        .user_agent(config.http.user_agent.clone())
        .pool_max_idle_per_host(config.http.max_keepalive)
        .connect_timeout(config.timeouts.connect_timeout())
        .read_timeout(config.timeouts.read_timeout())
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .context("build http client")
}
