use futures::TryStreamExt;
use std::io::{BufRead, BufReader};
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::{StreamReader, SyncIoBridge};
use url::Url;

/// Errors that can occur while opening a feed for reading.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The server did not answer within the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
}

/// Upper bound on the wait between two attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Retry behaviour for [`open`].
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

/// A feed body being streamed from the network.
pub struct FeedSource {
    /// URL the body was served from, after redirects.
    pub origin: Url,
    /// Blocking reader over the response body. Must be read outside the
    /// async runtime's worker threads, e.g. in `spawn_blocking`.
    pub reader: Box<dyn BufRead + Send>,
}

/// Exponential backoff for the given retry, capped at [`MAX_RETRY_DELAY`].
fn retry_delay(backoff: Duration, retry_count: u32) -> Duration {
    backoff
        .checked_mul(2u32.saturating_pow(retry_count))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}

/// Sends the request and hands back the body as a blocking reader.
///
/// Only the wait for response headers is retried (429 and 5xx, with
/// exponential backoff) or bounded by `policy.timeout`; once the body
/// starts flowing it is read as-is, however long the document.
///
/// # Errors
///
/// - [`FetchError::Network`] - Connection or TLS errors
/// - [`FetchError::Timeout`] - No response within the timeout
/// - [`FetchError::HttpStatus`] - Non-2xx response, or 5xx after max retries
/// - [`FetchError::RateLimited`] - 429 response after max retries
pub async fn open(
    client: &reqwest::Client,
    url: &Url,
    policy: FetchPolicy,
) -> Result<FeedSource, FetchError> {
    let mut retry_count = 0;

    let response = loop {
        let response = tokio::time::timeout(policy.timeout, client.get(url.clone()).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        let status = response.status();
        let rate_limited = status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        if rate_limited || status.is_server_error() {
            if retry_count >= policy.max_retries {
                return Err(if rate_limited {
                    FetchError::RateLimited(policy.max_retries)
                } else {
                    FetchError::HttpStatus(status.as_u16())
                });
            }

            let delay = retry_delay(policy.backoff, retry_count);
            tracing::warn!(
                feed = %url,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Feed server not ready, retrying after delay"
            );

            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        break response;
    };

    let origin = response.url().clone();
    if origin != *url {
        tracing::debug!(requested = %url, origin = %origin, "Feed was redirected");
    }

    let body = response.bytes_stream().map_err(std::io::Error::other);
    let reader = SyncIoBridge::new(StreamReader::new(Box::pin(body)));

    Ok(FeedSource {
        origin,
        reader: Box::new(BufReader::new(reader)),
    })
}
