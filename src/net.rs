//! Retrying HTTP helpers shared by the HTTP node set, the HTTP broadcaster and the
//! replica client. Only transport errors are retried; any HTTP status is returned to
//! the caller to interpret.

use serde::Serialize;
use std::time::Duration;

const INITIAL_BACKOFF_MS: u64 = 150;
const MAX_BACKOFF_MS: u64 = 1200;

pub async fn post_with_retry<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    payload: &T,
    timeout: Duration,
    attempts: usize,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut delay_ms = INITIAL_BACKOFF_MS;
    let attempts = attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.post(url).json(payload).timeout(timeout).send().await {
            Ok(resp) => return Ok(resp),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::debug!("POST {} failed (attempt {}): {}", url, attempt, e);
                delay_ms = backoff(delay_ms).await;
            }
        }
    }
}

pub async fn get_with_retry(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    attempts: usize,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut delay_ms = INITIAL_BACKOFF_MS;
    let attempts = attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.get(url).timeout(timeout).send().await {
            Ok(resp) => return Ok(resp),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::debug!("GET {} failed (attempt {}): {}", url, attempt, e);
                delay_ms = backoff(delay_ms).await;
            }
        }
    }
}

/// Sleeps for `delay_ms` plus jitter and returns the next delay.
async fn backoff(delay_ms: u64) -> u64 {
    let jitter = rand::random::<u64>() % 50;
    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
    (delay_ms * 2).min(MAX_BACKOFF_MS)
}

pub fn url(host: &str, path: &str) -> String {
    format!("http://{}{}", host, path)
}
