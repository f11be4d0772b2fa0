//! Shared HTTP plumbing for the remote endpoints.
//!
//! Every remote call in this crate goes through [`request_json`], which
//! enforces a per-endpoint minimum inter-call interval, retries transient
//! failures with jittered exponential backoff, and honors server rate-limit
//! hints. The design keeps at most one request in flight per client, trading
//! throughput for API courtesy.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Maximum number of transient failures tolerated per logical call.
pub const MAX_RETRIES: u32 = 5;

/// Wait applied on HTTP 429 when the server sends no `Retry-After` hint.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Request timeout for a single HTTP attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A failed remote call after all retries were exhausted.
///
/// Callers must treat this as "no data for this call" and continue with
/// cached or fallback data rather than aborting the whole batch.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Enforces a minimum interval between consecutive calls to one endpoint.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: None,
        }
    }

    /// Sleeps until the minimum interval since the previous call has passed,
    /// then records the current call.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                async_std::task::sleep(self.min_interval - elapsed).await;
            }
        }
        self.last_call = Some(Instant::now());
    }
}

/// Computes the backoff delay for a retry attempt (0-based).
///
/// The base delay is `2 × (attempt + 1)` seconds; `jitter` shifts it by up
/// to ±20 % so that independent clients do not retry in lockstep. Values
/// outside `[-0.2, 0.2]` are clamped.
pub fn backoff_delay(attempt: u32, jitter: f64) -> Duration {
    let base = 2.0 * (attempt as f64 + 1.0);
    Duration::from_secs_f64(base * (1.0 + jitter.clamp(-0.2, 0.2)))
}

/// Produces a jitter factor in `[-0.2, 0.2]` from the clock's sub-second
/// nanos. Retries only need to desynchronize, not be unpredictable.
fn random_jitter() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64 / u32::MAX as f64) * 0.4 - 0.2
}

/// Reads the server's `Retry-After` hint, falling back to the default.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Issues a throttled GET request and parses the JSON response, retrying
/// transient failures.
///
/// An HTTP 429 sleeps for the server's `Retry-After` hint and retries
/// without consuming an attempt. Any other failure (connect error, timeout,
/// error status, malformed JSON body) consumes an attempt and backs off with
/// jitter; exhausting [`MAX_RETRIES`] surfaces the last error as
/// [`FetchError::RetriesExhausted`].
///
/// # Arguments
///
/// * `client`: The shared `reqwest::Client`.
/// * `throttle`: The per-endpoint throttle state.
/// * `url`: The endpoint URL.
/// * `params`: Query parameters.
pub async fn request_json(
    client: &reqwest::Client,
    throttle: &mut Throttle,
    url: &str,
    params: &[(&str, &str)],
) -> Result<serde_json::Value, FetchError> {
    let mut attempts: u32 = 0;

    loop {
        throttle.wait().await;

        let result = client
            .get(url)
            .query(params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        let err: reqwest::Error = match result {
            Ok(response) if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                let wait = retry_after(response.headers());
                log::warn!(
                    "rate limited by {url}, waiting {}s before retrying",
                    wait.as_secs()
                );
                async_std::task::sleep(wait).await;
                // A server-directed wait does not consume a retry attempt.
                continue;
            }
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.json::<serde_json::Value>().await {
                    Ok(json) => return Ok(json),
                    Err(err) => err,
                },
                Err(err) => err,
            },
            Err(err) => err,
        };

        attempts += 1;
        if attempts >= MAX_RETRIES {
            return Err(FetchError::RetriesExhausted {
                attempts,
                source: err,
            });
        }

        let delay = backoff_delay(attempts - 1, random_jitter());
        log::warn!(
            "request to {url} failed (attempt {attempts}): {err}; retrying in {:.2}s",
            delay.as_secs_f64()
        );
        async_std::task::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_with_attempt() {
        assert_eq!(backoff_delay(0, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(1, 0.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, 0.0), Duration::from_secs(10));
    }

    #[test]
    fn backoff_applies_bounded_jitter() {
        assert_eq!(backoff_delay(0, 0.2), Duration::from_secs_f64(2.4));
        assert_eq!(backoff_delay(0, -0.2), Duration::from_secs_f64(1.6));
        // Out-of-range jitter is clamped, never amplified.
        assert_eq!(backoff_delay(0, 5.0), Duration::from_secs_f64(2.4));
        assert_eq!(backoff_delay(0, -5.0), Duration::from_secs_f64(1.6));
    }

    #[test]
    fn random_jitter_stays_in_range() {
        for _ in 0..100 {
            let jitter = random_jitter();
            assert!((-0.2..=0.2).contains(&jitter), "jitter {jitter} out of range");
        }
    }

    #[test]
    fn retry_after_parses_header_or_defaults() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);

        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Duration::from_secs(7));

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);
    }

    #[tokio::test]
    async fn throttle_enforces_minimum_interval() {
        let mut throttle = Throttle::new(Duration::from_millis(30));
        let start = Instant::now();
        throttle.wait().await; // First call is immediate.
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
