//! Outbound HTTP shared by the providers.
//!
//! One pool per provider. All calls funnel through a pacing gate that
//! enforces a minimum spacing between requests, 429/503 responses on
//! idempotent calls back off exponentially, and transport failures rotate
//! through the configured endpoint list before giving up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{CadenzaError, Result};

pub const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(200);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

pub struct HttpPool {
    client: Client,
    min_spacing: Duration,
    next_slot: Mutex<Instant>,
    endpoints: Vec<String>,
    current_endpoint: AtomicUsize,
}

impl HttpPool {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self::with_spacing(endpoints, DEFAULT_MIN_SPACING)
    }

    pub fn with_spacing(endpoints: Vec<String>, min_spacing: Duration) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(ATTEMPT_TIMEOUT)
            .cookie_store(true)
            .build()
            .unwrap_or_default();
        Self {
            client,
            min_spacing,
            next_slot: Mutex::new(Instant::now()),
            endpoints,
            current_endpoint: AtomicUsize::new(0),
        }
    }

    /// Index of the endpoint currently in use. Moves forward when a
    /// transport failure forces a rotation.
    pub fn current_endpoint(&self) -> usize {
        self.current_endpoint.load(Ordering::Relaxed) % self.endpoints.len().max(1)
    }

    /// Wait for the next free request slot. The lock is held only long
    /// enough to claim the slot; the sleep happens outside it.
    async fn pace(&self) {
        let wait = {
            let mut slot = self.next_slot.lock().await;
            let now = Instant::now();
            let start = if *slot > now { *slot } else { now };
            *slot = start + self.min_spacing;
            start.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn absolute_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") || self.endpoints.is_empty()
        {
            return path.to_string();
        }
        let base = &self.endpoints[self.current_endpoint()];
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn rotate_endpoint(&self, failed_url: &str) {
        if self.endpoints.len() > 1 {
            let next = self.current_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "endpoint {} failed, rotating to {}",
                failed_url,
                self.endpoints[next % self.endpoints.len()]
            );
        }
    }

    /// GET with pacing, retry, and endpoint rotation. The response is
    /// returned as soon as the headers are in; the body streams.
    pub async fn get(&self, path: &str) -> Result<Response> {
        self.get_with(path, |req| req).await
    }

    pub async fn get_with<F>(&self, path: &str, decorate: F) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let mut retry_attempts = 0u32;
        let mut rotations = 0usize;

        loop {
            self.pace().await;
            let url = self.absolute_url(path);
            let request = decorate(self.client.get(&url));

            match request.send().await {
                Err(e) if e.is_connect() || e.is_timeout() => {
                    rotations += 1;
                    if rotations >= self.endpoints.len().max(1) {
                        return Err(CadenzaError::Transient(format!(
                            "all endpoints exhausted: {}",
                            e
                        )));
                    }
                    self.rotate_endpoint(&url);
                }
                Err(e) => return Err(CadenzaError::Http(e)),
                Ok(resp)
                    if resp.status() == StatusCode::TOO_MANY_REQUESTS
                        || resp.status() == StatusCode::SERVICE_UNAVAILABLE =>
                {
                    retry_attempts += 1;
                    if retry_attempts >= MAX_RETRY_ATTEMPTS {
                        return Err(CadenzaError::RateLimited);
                    }
                    let backoff = BACKOFF_BASE * 2u32.pow(retry_attempts - 1);
                    debug!(
                        "{} from {}, backing off {:?} (attempt {})",
                        resp.status(),
                        url,
                        backoff,
                        retry_attempts
                    );
                    tokio::time::sleep(backoff).await;
                }
                Ok(resp) => return Ok(resp),
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_json_with(path, |req| req).await
    }

    pub async fn get_json_with<T, F>(&self, path: &str, decorate: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let resp = self.get_with(path, decorate).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CadenzaError::Transient(format!(
                "upstream returned {} for {}",
                status, path
            )));
        }
        Ok(resp.json::<T>().await?)
    }

    /// Non-idempotent call: paced, single attempt, no retry.
    pub async fn post_json_with<T, F>(&self, path: &str, decorate: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        self.pace().await;
        let url = self.absolute_url(path);
        let resp = decorate(self.client.post(&url)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CadenzaError::Transient(format!(
                "upstream returned {} for {}",
                status, path
            )));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pacing_spaces_out_slots() {
        let pool = HttpPool::with_spacing(vec![], Duration::from_millis(50));
        let start = Instant::now();
        pool.pace().await;
        pool.pace().await;
        pool.pace().await;
        // Three slots at 50ms spacing: the third starts at +100ms.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn absolute_urls_bypass_endpoint_list() {
        let pool = HttpPool::new(vec!["https://primary.example".to_string()]);
        assert_eq!(
            pool.absolute_url("https://cdn.example/file.flac"),
            "https://cdn.example/file.flac"
        );
        assert_eq!(
            pool.absolute_url("track/?id=1"),
            "https://primary.example/track/?id=1"
        );
    }

    #[test]
    fn rotation_advances_through_the_list() {
        let pool = HttpPool::new(vec![
            "https://a.example".to_string(),
            "https://b.example".to_string(),
            "https://c.example".to_string(),
        ]);
        assert_eq!(pool.current_endpoint(), 0);
        pool.rotate_endpoint("https://a.example/x");
        assert_eq!(pool.current_endpoint(), 1);
        pool.rotate_endpoint("https://b.example/x");
        assert_eq!(pool.current_endpoint(), 2);
        // Wraps around rather than falling off the end.
        pool.rotate_endpoint("https://c.example/x");
        assert_eq!(pool.current_endpoint(), 0);
    }
}
