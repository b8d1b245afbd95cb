//! Submit-and-poll client for Azure Document Intelligence / Form Recognizer.

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AnalysisBackend, JobHandle, Payload, PollPolicy};
use crate::analysis::{AnalysisResult, AnalyzeOperation, JobStatus};
use crate::config::OcrConfig;
use crate::endpoints::{model_catalog_candidates, CandidateEndpoint};
use crate::error::OcrError;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OPERATION_LOCATION_HEADER: &str = "operation-location";

/// Upper bound on a server-requested `Retry-After` wait while polling.
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Model listings are paged; stop following `nextLink` after this many pages.
const MAX_CATALOG_PAGES: usize = 10;

pub struct DocumentIntelligenceClient {
    client: Client,
    policy: PollPolicy,
}

impl DocumentIntelligenceClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            policy: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ids of the models available on the configured resource.
    ///
    /// Tries the current listing API, then the mid-generation one.
    pub async fn list_models(&self, config: &OcrConfig) -> Result<Vec<String>, OcrError> {
        config.validate()?;

        let urls = model_catalog_candidates(&config.endpoint);
        let attempted = urls.len();
        let mut last_error = None;

        for url in urls {
            match self.fetch_model_pages(&url, config).await {
                Ok(ids) => {
                    info!("Listed {} models from {}", ids.len(), url);
                    return Ok(ids);
                }
                Err(e) => {
                    warn!("Model listing via {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => OcrError::AllCandidatesExhausted {
                attempted,
                last_error: Box::new(e),
            },
            None => OcrError::NoCandidates,
        })
    }

    async fn fetch_model_pages(
        &self,
        first_url: &str,
        config: &OcrConfig,
    ) -> Result<Vec<String>, OcrError> {
        let mut ids = Vec::new();
        let mut next = Some(first_url.to_string());
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == MAX_CATALOG_PAGES {
                warn!("Model listing truncated after {} pages", MAX_CATALOG_PAGES);
                break;
            }
            pages += 1;

            let response = self
                .client
                .get(&url)
                .header(SUBSCRIPTION_KEY_HEADER, &config.api_key)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(OcrError::Http { status, body });
            }

            let page: ModelListPage = response
                .json()
                .await
                .map_err(|e| OcrError::InvalidResponseShape(format!("model list: {}", e)))?;

            ids.extend(page.value.into_iter().map(|m| m.model_id));
            next = page.next_link.filter(|link| !link.is_empty());
        }

        ids.sort();
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl AnalysisBackend for DocumentIntelligenceClient {
    async fn submit(
        &self,
        candidate: &CandidateEndpoint,
        payload: &Payload,
        config: &OcrConfig,
    ) -> Result<JobHandle, OcrError> {
        let url = candidate.request_url(config.pages.as_deref());
        let mime = payload.mime();
        info!(
            "Submitting {} ({} bytes, {}) to {}",
            payload.filename,
            payload.data.len(),
            mime,
            url
        );

        let response = self
            .client
            .post(&url)
            .header(SUBSCRIPTION_KEY_HEADER, &config.api_key)
            .header(CONTENT_TYPE, mime)
            .body(payload.data.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Http { status, body });
        }

        let operation_location = response
            .headers()
            .get(OPERATION_LOCATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(OcrError::MissingJobLocation)?
            .to_string();

        debug!("Analysis job accepted: {}", operation_location);

        Ok(JobHandle {
            operation_location,
            api_version: candidate.api_version.clone(),
        })
    }

    async fn poll(&self, job: &JobHandle, config: &OcrConfig) -> Result<AnalysisResult, OcrError> {
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            let response = self
                .client
                .get(&job.operation_location)
                .header(SUBSCRIPTION_KEY_HEADER, &config.api_key)
                .send()
                .await?;

            let status = response.status();
            let mut wait = self.policy.interval;

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                wait = parse_retry_after(retry_after).unwrap_or(wait);
                warn!(
                    "Poll {}/{} rate limited, waiting {:?}",
                    attempt, attempts, wait
                );
            } else if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(OcrError::Http { status, body });
            } else {
                let body = response.text().await?;
                let operation: AnalyzeOperation = serde_json::from_str(&body)
                    .map_err(|e| OcrError::InvalidResponseShape(format!("poll response: {}", e)))?;

                match operation.status {
                    JobStatus::Succeeded => {
                        let tree = operation.analyze_result.ok_or_else(|| {
                            OcrError::InvalidResponseShape(
                                "job succeeded without analyzeResult".to_string(),
                            )
                        })?;
                        info!(
                            "Analysis job succeeded after {} polls (api-version {})",
                            attempt, job.api_version
                        );
                        return AnalysisResult::from_value(tree).map_err(|e| {
                            OcrError::InvalidResponseShape(format!("analyzeResult: {}", e))
                        });
                    }
                    JobStatus::Failed => {
                        let reason = operation
                            .error
                            .map(|e| e.describe())
                            .unwrap_or_else(|| "analysis failed".to_string());
                        return Err(OcrError::JobFailed { reason });
                    }
                    other => {
                        debug!("Poll {}/{}: job is {:?}", attempt, attempts, other);
                    }
                }
            }

            if attempt < attempts {
                tokio::time::sleep(wait).await;
            }
        }

        Err(OcrError::PollTimeout { attempts })
    }
}

/// Parse a `Retry-After` value in seconds, capped.
fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
    let secs = header_value?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelListPage {
    #[serde(default)]
    value: Vec<ModelSummary>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelSummary {
    model_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_mock;
    use axum::http::{HeaderMap, StatusCode as MockStatus, Uri};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn config(base: &str) -> OcrConfig {
        OcrConfig {
            endpoint: base.to_string(),
            api_key: "test-key".to_string(),
            model_id: None,
            pages: None,
        }
    }

    fn client(interval_ms: u64, max_attempts: u32) -> DocumentIntelligenceClient {
        DocumentIntelligenceClient::new(Client::new()).with_poll_policy(PollPolicy {
            interval: Duration::from_millis(interval_ms),
            max_attempts,
        })
    }

    fn job(base: &str) -> JobHandle {
        JobHandle {
            operation_location: format!("{}/operations/1", base),
            api_version: "2024-11-30".to_string(),
        }
    }

    /// Poll route that reports `running` until the given call number, then succeeds.
    fn poll_router(calls: Arc<AtomicUsize>, succeed_on: usize) -> Router {
        Router::new().route(
            "/operations/1",
            get(move |headers: HeaderMap| async move {
                let key_ok = headers
                    .get("ocp-apim-subscription-key")
                    .map(|v| v.as_bytes() == b"test-key")
                    .unwrap_or(false);
                if !key_ok {
                    return (MockStatus::UNAUTHORIZED, "bad key").into_response();
                }
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let body = if n >= succeed_on {
                    r#"{"status":"succeeded","analyzeResult":{"content":"Name: Jane"}}"#
                } else {
                    r#"{"status":"running"}"#
                };
                ([("content-type", "application/json")], body).into_response()
            }),
        )
    }

    #[tokio::test]
    async fn test_poll_returns_result_after_running_twice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (base, shutdown) = spawn_mock(poll_router(calls.clone(), 3)).await;

        let started = Instant::now();
        let result = client(20, 10).poll(&job(&base), &config(&base)).await.unwrap();

        assert_eq!(result.content.as_deref(), Some("Name: Jane"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(40));

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_poll_times_out_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (base, shutdown) = spawn_mock(poll_router(calls.clone(), usize::MAX)).await;

        let err = client(5, 4).poll(&job(&base), &config(&base)).await.unwrap_err();

        assert!(
            matches!(err, OcrError::PollTimeout { attempts: 4 }),
            "expected PollTimeout but got: {:?}",
            err
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_poll_reports_failed_job_reason() {
        let app = Router::new().route(
            "/operations/1",
            get(|| async {
                r#"{"status":"failed","error":{"code":"InvalidRequest","message":"unsupported file"}}"#
            }),
        );
        let (base, shutdown) = spawn_mock(app).await;

        let err = client(5, 5).poll(&job(&base), &config(&base)).await.unwrap_err();
        match err {
            OcrError::JobFailed { reason } => {
                assert_eq!(reason, "InvalidRequest: unsupported file")
            }
            other => panic!("expected JobFailed but got: {:?}", other),
        }

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_poll_honours_rate_limit_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/operations/1",
            get(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    (MockStatus::TOO_MANY_REQUESTS, [("retry-after", "0")], "slow down")
                        .into_response()
                } else {
                    r#"{"status":"succeeded","analyzeResult":{}}"#.into_response()
                }
            }),
        );
        let (base, shutdown) = spawn_mock(app).await;

        let result = client(5, 3).poll(&job(&base), &config(&base)).await.unwrap();
        assert!(result.content.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_succeeded_without_result_is_invalid_shape() {
        let app = Router::new().route("/operations/1", get(|| async { r#"{"status":"succeeded"}"# }));
        let (base, shutdown) = spawn_mock(app).await;

        let err = client(5, 2).poll(&job(&base), &config(&base)).await.unwrap_err();
        assert!(matches!(err, OcrError::InvalidResponseShape(_)));

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_submit_sends_key_and_reads_operation_location() {
        let app = Router::new().route(
            "/analyze",
            post(|uri: Uri, headers: HeaderMap, body: String| async move {
                let key_ok = headers
                    .get("ocp-apim-subscription-key")
                    .map(|v| v.as_bytes() == b"test-key")
                    .unwrap_or(false);
                let type_ok = headers
                    .get("content-type")
                    .map(|v| v.as_bytes() == b"application/pdf")
                    .unwrap_or(false);
                if !key_ok || !type_ok || body != "%PDF-1.4" {
                    return MockStatus::BAD_REQUEST.into_response();
                }
                if uri.query() != Some("api-version=2024-11-30&pages=1-") {
                    return MockStatus::NOT_FOUND.into_response();
                }
                let host = headers
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    MockStatus::ACCEPTED,
                    [("operation-location", format!("http://{}/operations/1", host))],
                )
                    .into_response()
            }),
        );
        let (base, shutdown) = spawn_mock(app).await;

        let candidate = CandidateEndpoint {
            url: format!("{}/analyze", base),
            api_version: "2024-11-30".to_string(),
            is_legacy_path: false,
        };
        let payload = Payload::new("intake.pdf", None, b"%PDF-1.4".to_vec());
        let cfg = OcrConfig {
            pages: Some("1-".to_string()),
            ..config(&base)
        };

        let handle = client(5, 1).submit(&candidate, &payload, &cfg).await.unwrap();
        assert_eq!(handle.operation_location, format!("{}/operations/1", base));
        assert_eq!(handle.api_version, "2024-11-30");

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_submit_without_operation_location_fails() {
        let app = Router::new().route("/analyze", post(|| async { MockStatus::ACCEPTED }));
        let (base, shutdown) = spawn_mock(app).await;

        let candidate = CandidateEndpoint {
            url: format!("{}/analyze", base),
            api_version: "v2.1".to_string(),
            is_legacy_path: true,
        };
        let payload = Payload::new("scan.png", None, vec![1, 2, 3]);

        let err = client(5, 1)
            .submit(&candidate, &payload, &config(&base))
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::MissingJobLocation));

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_submit_surfaces_http_status() {
        let app = Router::new().route(
            "/analyze",
            post(|| async { (MockStatus::UNAUTHORIZED, "Access denied") }),
        );
        let (base, shutdown) = spawn_mock(app).await;

        let candidate = CandidateEndpoint {
            url: format!("{}/analyze", base),
            api_version: "2024-11-30".to_string(),
            is_legacy_path: false,
        };
        let payload = Payload::new("scan.png", None, vec![1]);

        let err = client(5, 1)
            .submit(&candidate, &payload, &config(&base))
            .await
            .unwrap_err();
        match err {
            OcrError::Http { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "Access denied");
            }
            other => panic!("expected Http but got: {:?}", other),
        }

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_list_models_falls_back_to_older_api() {
        let app = Router::new()
            .route(
                "/documentintelligence/documentModels",
                get(|| async { MockStatus::NOT_FOUND }),
            )
            .route(
                "/formrecognizer/documentModels",
                get(|| async {
                    r#"{"value":[{"modelId":"prebuilt-read"},{"modelId":"intake-form"}]}"#
                }),
            );
        let (base, shutdown) = spawn_mock(app).await;

        let ids = client(5, 1).list_models(&config(&base)).await.unwrap();
        assert_eq!(ids, vec!["intake-form".to_string(), "prebuilt-read".to_string()]);

        let _ = shutdown.send(());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("5")), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(Some("600")), Some(Duration::from_secs(60)));
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
