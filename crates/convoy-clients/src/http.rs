//! Shared HTTP machinery: clients, retry policy, readiness polling.
//!
//! Conventions every service client follows:
//! - connection errors and server-side statuses retry with exponential
//!   backoff (base 1 s, doubling, capped at 30 s, max 3 retries);
//! - 4xx never retries — except 401, which callers handle with a single
//!   credential refresh;
//! - readiness means any HTTP response with status < 500.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Statuses that indicate a transient server-side problem.
pub const RETRYABLE_STATUS: [u16; 9] = [500, 502, 503, 504, 520, 521, 522, 523, 524];

/// Deadline for a service to come up.
pub const READY_TIMEOUT: Duration = Duration::from_secs(180);
/// Poll interval while waiting for readiness.
pub const READY_INTERVAL: Duration = Duration::from_secs(5);
/// Connect timeout applied to every client.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// First backoff delay.
    pub base: Duration,
    /// Backoff ceiling.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Build a JSON API client with the standard timeouts.
///
/// # Errors
///
/// Returns an error when the TLS backend cannot be initialised.
pub fn build_client(read_timeout: Duration) -> ClientResult<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(read_timeout)
        .build()
        .map_err(|source| ClientError::Http {
            service: "client",
            source,
        })
}

/// Build a client that keeps session cookies, for services that authenticate
/// with a session id instead of a header.
///
/// # Errors
///
/// Returns an error when the TLS backend cannot be initialised.
pub fn build_cookie_client(read_timeout: Duration) -> ClientResult<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(read_timeout)
        .cookie_store(true)
        .build()
        .map_err(|source| ClientError::Http {
            service: "client",
            source,
        })
}

/// Whether a status code is worth retrying.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUS.contains(&status.as_u16())
}

/// Send a request with the retry policy. The builder closure is invoked once
/// per attempt so the request body is rebuilt rather than reused.
///
/// The returned response may still carry an error status; callers that
/// require success should follow with [`require_success`].
///
/// # Errors
///
/// Returns a transport error once retries are exhausted.
pub async fn send_with_retry(
    service: &'static str,
    policy: RetryPolicy,
    mut build: impl FnMut() -> RequestBuilder,
) -> ClientResult<Response> {
    let mut attempt = 0u32;
    loop {
        let result = build().send().await;
        match result {
            Ok(response) if is_retryable_status(response.status()) && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                debug!(
                    service,
                    status = response.status().as_u16(),
                    attempt,
                    ?delay,
                    "retrying on server error"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Ok(response) => return Ok(response),
            Err(source) if attempt < policy.max_retries && is_transient(&source) => {
                let delay = policy.delay(attempt);
                debug!(service, error = %source, attempt, ?delay, "retrying on transport error");
                sleep(delay).await;
                attempt += 1;
            }
            Err(source) => return Err(ClientError::Http { service, source }),
        }
    }
}

/// Turn an error-status response into [`ClientError::Status`], passing
/// success statuses through.
///
/// # Errors
///
/// Returns [`ClientError::Status`] for any non-2xx response.
pub async fn require_success(service: &'static str, response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        service,
        status: status.as_u16(),
        body: truncate(&body, 300),
    })
}

/// Poll an HTTP endpoint until it answers with any status < 500.
///
/// Returns `(ready, detail)`; never errors — an unreachable service is a
/// normal outcome while containers boot.
pub async fn wait_for_http_ready(
    url: &str,
    timeout: Duration,
    interval: Duration,
) -> (bool, String) {
    let client = match build_client(Duration::from_secs(5)) {
        Ok(client) => client,
        Err(err) => return (false, err.to_string()),
    };
    let deadline = Instant::now() + timeout;
    let mut last_error = String::from("no response");

    loop {
        match client.get(url).send().await {
            Ok(response) if response.status().as_u16() < 500 => {
                return (true, format!("{url} ready ({})", response.status().as_u16()));
            }
            Ok(response) => {
                last_error = format!("HTTP {}", response.status().as_u16());
            }
            Err(err) => {
                last_error = err.to_string();
            }
        }
        if Instant::now() >= deadline {
            return (false, format!("timeout waiting for {url}: {last_error}"));
        }
        sleep(interval).await;
    }
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503);
        });

        let client = build_client(Duration::from_secs(2)).unwrap();
        let url = server.url("/flaky");
        let response = send_with_retry("test", fast_policy(), || client.get(&url))
            .await
            .expect("transport ok");
        // All four attempts hit the mock and the last response is surfaced.
        assert_eq!(response.status().as_u16(), 503);
        assert_eq!(failing.hits(), 4);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start();
        let not_found = server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404);
        });

        let client = build_client(Duration::from_secs(2)).unwrap();
        let url = server.url("/missing");
        let response = send_with_retry("test", fast_policy(), || client.get(&url))
            .await
            .expect("transport ok");
        assert_eq!(response.status().as_u16(), 404);
        assert_eq!(not_found.hits(), 1);

        let err = require_success("test", response).await.expect_err("status");
        assert!(matches!(err, ClientError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn readiness_accepts_any_sub_500_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/login");
            then.status(401);
        });

        let url = server.url("/login");
        let (ready, detail) = wait_for_http_ready(
            &url,
            Duration::from_secs(1),
            Duration::from_millis(20),
        )
        .await;
        assert!(ready, "{detail}");
        assert!(detail.contains("401"));
    }

    #[tokio::test]
    async fn readiness_times_out_with_last_error() {
        // Nothing listens on this port.
        let (ready, detail) = wait_for_http_ready(
            "http://127.0.0.1:1/status",
            Duration::from_millis(100),
            Duration::from_millis(30),
        )
        .await;
        assert!(!ready);
        assert!(detail.contains("timeout waiting for"));
    }
}
