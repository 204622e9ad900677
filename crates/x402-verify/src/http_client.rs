//! Outbound HTTP plumbing shared by the facilitator client and the chain readers.

use std::time::Duration;

use crate::VerifyError;

/// Builds the one `reqwest::Client` every backend shares.
///
/// Redirects are disabled: a facilitator or RPC node that redirects is
/// treated as unavailable rather than followed somewhere unvetted.
pub fn build_client(request_timeout: Duration) -> Result<reqwest::Client, VerifyError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(request_timeout)
        .connect_timeout(request_timeout.min(Duration::from_secs(3)))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| VerifyError::HttpError(format!("failed to build HTTP client: {e}")))
}

/// Small fixed retry budget for transport-level failures.
///
/// Only connection errors and 5xx responses are retried. This sits below the
/// engine's per-backend deadline, which still bounds the whole call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Send the request built by `make`, retrying per `policy`.
///
/// `make` is called once per attempt because a `RequestBuilder` is consumed
/// by `send`.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    mut make: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match make().send().await {
            Ok(resp) if resp.status().is_server_error() && attempt < max_attempts => {
                tracing::warn!(
                    status = %resp.status(),
                    attempt,
                    "upstream server error, retrying"
                );
            }
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_connect() && attempt < max_attempts => {
                tracing::warn!(error = %e, attempt, "connection failed, retrying");
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(policy.delay(attempt)).await;
        attempt += 1;
    }
}
