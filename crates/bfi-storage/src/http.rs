//! HTTP transport with bounded retries and request pacing.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Attempt budget for a single request. `max_retries` counts retries, so a
/// request is tried at most `max_retries + 1` times.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub pacing: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            pacing: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            }),
        }
    }
}

/// Spaces out consecutive requests to the open-data portal.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

/// Failure to obtain one batch from the remote feed. Carries how many attempts
/// were spent so the run log can say why it gave up.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("remote api error: {message}")]
    Api { message: String, attempts: usize },
    #[error("decoding {context}: {source}")]
    Decode {
        context: String,
        attempts: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("fixture {path}: {message}")]
    Fixture { path: String, message: String },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Request { attempts, .. }
            | FetchError::HttpStatus { attempts, .. }
            | FetchError::Api { attempts, .. }
            | FetchError::Decode { attempts, .. } => *attempts,
            FetchError::Fixture { .. } => 1,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacing: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            pacing: config
                .pacing
                .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every)),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url` with `query`, retrying timeouts, connect errors, 429 and 5xx
    /// until the backoff budget is spent.
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        if let Some(bucket) = &self.pacing {
            bucket.take().await;
        }
        let span = info_span!("http_fetch", url);
        self.get_with_retries(url, query).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let can_retry = attempt < max_attempts;

            let err = match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    attempts: attempt,
                                })
                            }
                            Err(err) => err,
                        }
                    } else {
                        if classify_status(status) == RetryDisposition::Retryable && can_retry {
                            warn!(attempt, status = status.as_u16(), "retryable http status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            attempts: attempt,
                        });
                    }
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                warn!(attempt, error = %err, "retryable request error");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
                continue;
            }
            return Err(FetchError::Request {
                url: url.to_string(),
                attempts: attempt,
                source: err,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers the n-th connection with `statuses[n]`, repeating the last one.
    async fn canned_server(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/3/action/datastore_search_sql", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let served = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses[served.min(statuses.len() - 1)];

                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&chunk[..read]),
                    }
                }

                let body = r#"{"success":true,"result":{"records":[]}}"#;
                let response = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (url, hits)
    }

    fn quick_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            pacing: None,
        })
        .unwrap()
    }

    fn sql_query() -> Vec<(&'static str, String)> {
        vec![("sql", "SELECT 1".to_string())]
    }

    #[tokio::test]
    async fn persistent_server_errors_spend_the_whole_attempt_budget() {
        let (url, hits) = canned_server(vec![503]).await;
        let fetcher = quick_fetcher(2);

        let err = fetcher.get(&url, &sql_query()).await.unwrap_err();
        assert!(
            matches!(err, FetchError::HttpStatus { status: 503, attempts: 3, .. }),
            "{err}"
        );
        assert_eq!(err.attempts(), fetcher.backoff().max_attempts());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = canned_server(vec![404]).await;
        let fetcher = quick_fetcher(3);

        let err = fetcher.get(&url, &sql_query()).await.unwrap_err();
        assert!(
            matches!(err, FetchError::HttpStatus { status: 404, attempts: 1, .. }),
            "{err}"
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_then_success_reports_attempts_used() {
        let (url, hits) = canned_server(vec![503, 200]).await;
        let fetcher = quick_fetcher(3);

        let response = fetcher.get(&url, &sql_query()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.attempts, 2);
        assert!(response.final_url.contains("sql=SELECT"), "{}", response.final_url);
        assert!(String::from_utf8_lossy(&response.body).contains("\"success\":true"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };

        assert_eq!(policy.max_attempts(), 4);
        let delays = (0..4).map(|i| policy.delay_for_attempt(i)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [250, 500, 1000, 1000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(1));
    }

    #[test]
    fn only_throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::CONFLICT), RetryDisposition::NonRetryable);
    }

    #[test]
    fn fetch_errors_report_attempts() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://data.example/api".into(),
            attempts: 4,
        };
        assert_eq!(err.attempts(), 4);
        assert!(err.to_string().contains("after 4 attempt(s)"));

        let fixture = FetchError::Fixture {
            path: "missing.json".into(),
            message: "not found".into(),
        };
        assert_eq!(fixture.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_spaces_out_requests() {
        let bucket = SimpleTokenBucket::new(1, Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
