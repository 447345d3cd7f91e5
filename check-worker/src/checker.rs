use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use tracing::debug;
use url::Url;

use check_common::queue::TaskPayload;
use check_common::types::{CheckRequest, CheckResponse, Infotree, ReplResponse, Snippet};

use crate::config::Config;
use crate::error::{CheckerError, WorkerError};

/// Options forwarded with every checker invocation, taken from the task
/// payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOptions {
    pub timeout: f64,
    pub debug: bool,
    pub reuse: bool,
    pub infotree: Option<Infotree>,
}

impl CheckOptions {
    pub fn from_task(task: &TaskPayload) -> Self {
        Self {
            timeout: task.timeout,
            debug: task.debug,
            reuse: task.reuse,
            infotree: task.infotree,
        }
    }
}

/// The external snippet checker. Implementations fail with a status-coded
/// error when the checker answers with a non-success status; anything else
/// (transport, decoding) counts as unexpected and is never retried.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn run_checks(
        &self,
        snippets: &[Snippet],
        options: &CheckOptions,
    ) -> Result<Vec<ReplResponse>, CheckerError>;
}

/// Talks to the checker service's synchronous check endpoint. The service
/// owns the long-lived REPL pool; the configured minimum host free memory
/// is forwarded as a header so the pool's memory guard can honor it.
pub struct HttpChecker {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpChecker {
    pub fn new(config: &Config) -> Result<Self, WorkerError> {
        let endpoint = Url::parse(&config.checker_url)?.join("/api/check")?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            "x-min-host-free-mem-mb",
            header::HeaderValue::from_str(&config.min_host_free_mem.0.to_string())
                .expect("decimal digits are a valid header value"),
        );

        // The checker bounds each request with the timeout carried in the
        // request body; only the connection attempt is bounded here.
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("check-worker")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(WorkerError::Client)?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
        })
    }
}

fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "error"] {
            if let Some(detail) = parsed.get(key).and_then(|value| value.as_str()) {
                return detail.to_owned();
            }
        }
    }
    if body.is_empty() {
        status.to_string()
    } else {
        body.to_owned()
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn run_checks(
        &self,
        snippets: &[Snippet],
        options: &CheckOptions,
    ) -> Result<Vec<ReplResponse>, CheckerError> {
        let request = CheckRequest {
            snippets: snippets.to_vec(),
            timeout: options.timeout as u64,
            debug: options.debug,
            reuse: options.reuse,
            infotree: options.infotree,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CheckerError::Status {
                status,
                detail: error_detail(status, &body),
            });
        }

        let check: CheckResponse = response.json().await?;
        debug!(results = check.results.len(), "checker call succeeded");
        Ok(check.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvMemoryMb;
    use httpmock::prelude::*;
    use serde_json::json;

    fn config(checker_url: &str, api_key: Option<&str>) -> Config {
        Config {
            host: "127.0.0.1".to_owned(),
            port: 8001,
            async_enabled: true,
            redis_url: None,
            async_queue_name: "lean_async_check".to_owned(),
            async_result_ttl_sec: 86400,
            async_backlog_limit: 50000,
            async_redis_key_prefix: "lean_async".to_owned(),
            async_use_in_memory_backend: true,
            async_worker_retries: 3,
            async_dequeue_timeout_sec: 3,
            checker_url: checker_url.to_owned(),
            api_key: api_key.map(str::to_owned),
            min_host_free_mem: EnvMemoryMb(4096),
        }
    }

    fn snippet() -> Snippet {
        Snippet {
            id: "s1".to_owned(),
            code: "#check Nat".to_owned(),
        }
    }

    fn options() -> CheckOptions {
        CheckOptions {
            timeout: 30.0,
            debug: false,
            reuse: true,
            infotree: None,
        }
    }

    #[tokio::test]
    async fn successful_check_returns_responses() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/check")
                    .header("x-min-host-free-mem-mb", "4096")
                    .json_body_partial(r##"{"snippets":[{"id":"s1","code":"#check Nat"}]}"##);
                then.status(200).json_body(json!({
                    "results": [{"id": "s1", "time": 0.2, "response": {"env": 0}}]
                }));
            })
            .await;

        let checker = HttpChecker::new(&config(&server.base_url(), None)).unwrap();
        let responses = checker.run_checks(&[snippet()], &options()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, "s1");
        assert_eq!(responses[0].response, Some(json!({"env": 0})));
    }

    #[tokio::test]
    async fn error_status_carries_the_detail() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/check");
                then.status(429)
                    .json_body(json!({"detail": "No available REPLs"}));
            })
            .await;

        let checker = HttpChecker::new(&config(&server.base_url(), None)).unwrap();
        let error = checker
            .run_checks(&[snippet()], &options())
            .await
            .expect_err("non-2xx must fail");

        match error {
            CheckerError::Status { status, detail } => {
                assert_eq!(status.as_u16(), 429);
                assert_eq!(detail, "No available REPLs");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_key_is_sent_as_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/check")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(json!({"results": []}));
            })
            .await;

        let checker = HttpChecker::new(&config(&server.base_url(), Some("secret"))).unwrap();
        checker.run_checks(&[snippet()], &options()).await.unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn error_detail_prefers_structured_bodies() {
        let status = StatusCode::SERVICE_UNAVAILABLE;
        assert_eq!(
            error_detail(status, r#"{"detail":"pool exhausted"}"#),
            "pool exhausted"
        );
        assert_eq!(
            error_detail(status, r#"{"error":"pool exhausted"}"#),
            "pool exhausted"
        );
        assert_eq!(error_detail(status, "plain text"), "plain text");
        assert_eq!(error_detail(status, ""), "503 Service Unavailable");
    }
}
