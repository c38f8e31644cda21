//! HTTP binding of the resilient call layer.

use crate::cache::{cache_key, CachePolicy, CacheStore};
use crate::resilience::{CallError, CallOptions, CallOutcome, PermanentFailure, ResilientCaller, RetryConfig};
use anyhow::Context;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Response bodies larger than this are truncated
const MAX_BODY_BYTES: usize = 512 * 1024;

/// A downloaded page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub truncated: bool,
}

/// Outbound HTTP client whose reads go through retry and the shared cache
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    caller: ResilientCaller<FetchedPage>,
    retry: RetryConfig,
}

impl HttpFetcher {
    pub fn new(cache: Arc<CacheStore<FetchedPage>>, retry: RetryConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("geoscope/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            caller: ResilientCaller::new(cache),
            retry,
        })
    }

    pub fn with_concurrency_limit(mut self, max_concurrent: usize) -> Self {
        self.caller = self.caller.with_concurrency_limit(max_concurrent);
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn cache(&self) -> &Arc<CacheStore<FetchedPage>> {
        self.caller.cache()
    }

    /// Idempotent GET, cached and eligible for stale fallback
    pub async fn get(
        &self,
        url: &Url,
        cache_policy: Option<CachePolicy>,
        cancel: Option<CancellationToken>,
    ) -> Result<CallOutcome<FetchedPage>, CallError> {
        let mut options = CallOptions::read(cache_key("GET", url.as_str()));
        options.cache_policy = cache_policy;
        options.cancel = cancel;

        debug!(url = %url, "GET request");
        self.caller
            .call(options, &self.retry, || self.send(self.client.get(url.clone())))
            .await
    }

    /// Non-idempotent POST with a JSON body; never cached
    pub async fn post_json(
        &self,
        url: &Url,
        body: &serde_json::Value,
        cancel: Option<CancellationToken>,
    ) -> Result<CallOutcome<FetchedPage>, CallError> {
        let mut options = CallOptions::mutation(cache_key("POST", url.as_str()));
        options.cancel = cancel;

        debug!(url = %url, "POST request");
        self.caller
            .call(options, &self.retry, || {
                self.send(self.client.post(url.clone()).json(body))
            })
            .await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<FetchedPage> {
        let mut response = request.send().await.context("HTTP request failed")?;
        let status = response.status();
        let url = response.url().to_string();

        if !status.is_success() {
            let message = format!("{} returned {}", url, status);
            return Err(if is_retryable_status(status) {
                anyhow::anyhow!(message)
            } else {
                PermanentFailure(message).into()
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Stop reading at the cap; the rest of the body is never buffered
        let mut bytes = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read response body")?
        {
            let room = MAX_BODY_BYTES - bytes.len();
            if chunk.len() > room {
                bytes.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            url,
            status: status.as_u16(),
            content_type,
            body: decode_body(bytes, truncated),
            truncated,
        })
    }
}

/// Lossy UTF-8 decode. A character split by the size cap is dropped rather
/// than replaced.
fn decode_body(mut bytes: Vec<u8>, truncated: bool) -> String {
    if truncated {
        if let Err(e) = std::str::from_utf8(&bytes) {
            if e.error_len().is_none() {
                bytes.truncate(e.valid_up_to());
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Server errors, throttling and request timeouts are worth another attempt
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        let retry = RetryConfig {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_jitter: Duration::from_millis(1),
        };
        HttpFetcher::new(Arc::new(CacheStore::new()), retry).unwrap()
    }

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_split_character_dropped_at_cap() {
        let mut bytes = "ab".as_bytes().to_vec();
        bytes.extend_from_slice(&"é".as_bytes()[..1]);

        assert_eq!(decode_body(bytes.clone(), true), "ab");
        assert_eq!(decode_body(bytes, false), "ab\u{FFFD}");
    }

    #[tokio::test]
    async fn test_large_body_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(MAX_BODY_BYTES + 4096)))
            .mount(&server)
            .await;

        let page = fetcher().get(&url(&server, "/huge"), None, None).await.unwrap().value;
        assert!(page.truncated);
        assert_eq!(page.body.len(), MAX_BODY_BYTES);
    }

    #[tokio::test]
    async fn test_get_caches_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<h1>hello</h1>"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let target = url(&server, "/page");

        let first = fetcher.get(&target, None, None).await.unwrap();
        assert_eq!(first.value.body, "<h1>hello</h1>");
        assert_eq!(first.value.content_type.as_deref(), Some("text/html"));
        assert_eq!(first.cache_status(), "live");

        let second = fetcher.get(&target, None, None).await.unwrap();
        assert_eq!(second.cache_status(), "hit");
        assert_eq!(fetcher.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_get_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = fetcher()
            .get(&url(&server, "/flaky"), None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_get_does_not_retry_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher()
            .get(&url(&server, "/missing"), None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Rejected { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_stale_page_served_when_origin_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let target = url(&server, "/article");
        let policy = CachePolicy {
            ttl: Duration::ZERO,
            stale_grace: Duration::from_secs(60),
        };

        fetcher.get(&target, Some(policy), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let outcome = fetcher.get(&target, Some(policy), None).await.unwrap();
        assert!(outcome.is_stale());
        assert_eq!(outcome.value.body, "v1");
    }

    #[tokio::test]
    async fn test_post_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let target = url(&server, "/submit");
        let body = serde_json::json!({"url": "https://example.com"});

        fetcher.post_json(&target, &body, None).await.unwrap();
        let outcome = fetcher.post_json(&target, &body, None).await.unwrap();

        assert_eq!(outcome.cache_status(), "live");
        assert!(fetcher.cache().is_empty());
    }
}
