//! Outbound HTTP for platform adapters: bounded timeout, global concurrency cap, retry with backoff.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 is surfaced immediately so the caller can throttle instead of hammering the platform.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How a request authenticates against the platform.
#[derive(Clone)]
pub enum ApiAuth {
    None,
    Bearer(String),
    Header { name: &'static str, value: String },
}

impl std::fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiAuth::None => f.write_str("None"),
            ApiAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            ApiAuth::Header { name, .. } => write!(f, "Header({name}: <redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub source_id: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub auth: ApiAuth,
}

impl ApiRequest {
    pub fn get(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            query: Vec::new(),
            auth: ApiAuth::None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn auth(mut self, auth: ApiAuth) -> Self {
        self.auth = auth;
        self
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable payload from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET a JSON document. Non-2xx is an error carrying the status; a body that is not JSON is a decode error.
    pub async fn get_json(&self, request: ApiRequest) -> Result<JsonValue, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source_id = %request.source_id, url = %request.url);
        async {
            let body = self.send_with_retries(&request).await?;
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
                url: request.url.clone(),
                message: e.to_string(),
            })
        }
        .instrument(span)
        .await
    }

    async fn send_with_retries(&self, request: &ApiRequest) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut builder = self
                .client
                .get(&request.url)
                .header(reqwest::header::ACCEPT, "application/json");
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            builder = match &request.auth {
                ApiAuth::None => builder,
                ApiAuth::Bearer(token) => builder.bearer_auth(token),
                ApiAuth::Header { name, value } => builder.header(*name, value),
            };

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying after server error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: request.url.clone(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::State, http::HeaderMap, routing::get, Json, Router};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn fetcher(backoff: BackoffPolicy) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff,
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn too_many_requests_is_not_retried_in_place() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn bearer_auth_and_query_reach_the_server() {
        let app = Router::new().route(
            "/reviews",
            get(|headers: HeaderMap, axum::extract::RawQuery(q): axum::extract::RawQuery| async move {
                Json(serde_json::json!({
                    "auth": headers.get("authorization").and_then(|v| v.to_str().ok()),
                    "query": q,
                }))
            }),
        );
        let base = spawn(app).await;
        let body = fetcher(BackoffPolicy::none())
            .get_json(
                ApiRequest::get("yelp", format!("{base}/reviews"))
                    .query("limit", "50")
                    .auth(ApiAuth::Bearer("k-123".into())),
            )
            .await
            .expect("json");
        assert_eq!(body["auth"], "Bearer k-123");
        assert_eq!(body["query"], "limit=50");
    }

    #[tokio::test]
    async fn non_success_status_is_reported_with_code() {
        let app = Router::new().route(
            "/limited",
            get(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = spawn(app).await;
        let err = fetcher(BackoffPolicy::default())
            .get_json(ApiRequest::get("twitter", format!("{base}/limited")))
            .await
            .expect_err("429 must fail");
        assert_eq!(err.status(), Some(429));
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/flaky",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(axum::http::StatusCode::SERVICE_UNAVAILABLE)
                    } else {
                        Ok(Json(serde_json::json!({"ok": true})))
                    }
                }),
            )
            .with_state(hits.clone());
        let base = spawn(app).await;
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        };
        let body = fetcher(policy)
            .get_json(ApiRequest::get("trustpilot", format!("{base}/flaky")))
            .await
            .expect("second attempt succeeds");
        assert_eq!(body["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_json_body_is_a_decode_error() {
        let app = Router::new().route("/html", get(|| async { "<html>nope</html>" }));
        let base = spawn(app).await;
        let err = fetcher(BackoffPolicy::none())
            .get_json(ApiRequest::get("yelp", format!("{base}/html")))
            .await
            .expect_err("html is not json");
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
