use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{JobError, StandardError, WorkerError};
use crate::handler::{HandlerSettings, TaskHandler};
use crate::http::{HttpTransport, send_with_retry};
use crate::retry::RetryPolicy;
use crate::state_machine::ExecutionContext;

pub(super) const TASK_TYPE: &str = "fetch-external-record";

const MAX_RESOURCE_ID_LEN: usize = 128;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchInput {
    pub resource_id: String,
    #[serde(default)]
    pub query: Option<BTreeMap<String, String>>,
}

/// Fetches one record from a third-party API by id.
pub struct ExternalFetchHandler {
    transport: Arc<dyn HttpTransport>,
    endpoint: Url,
    policy: RetryPolicy,
    settings: HandlerSettings,
}

impl ExternalFetchHandler {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoint: &str,
        policy: RetryPolicy,
        settings: HandlerSettings,
    ) -> Result<Self, WorkerError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| WorkerError::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(WorkerError::Config(format!(
                "endpoint {endpoint} cannot carry a path"
            )));
        }
        Ok(Self {
            transport,
            endpoint,
            policy,
            settings,
        })
    }

    fn record_url(&self, input: &FetchInput) -> Result<Url, StandardError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StandardError::internal("endpoint cannot carry a path"))?
            .pop_if_empty()
            .push(&input.resource_id);
        if let Some(query) = &input.query {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl TaskHandler for ExternalFetchHandler {
    type Input = FetchInput;

    fn task_type(&self) -> &str {
        TASK_TYPE
    }

    fn settings(&self) -> HandlerSettings {
        self.settings
    }

    fn validate(&self, input: &FetchInput) -> Result<(), StandardError> {
        let id = &input.resource_id;
        if id.is_empty() {
            return Err(StandardError::validation("resource_id must not be empty"));
        }
        if id.len() > MAX_RESOURCE_ID_LEN {
            return Err(StandardError::validation(format!(
                "resource_id exceeds {MAX_RESOURCE_ID_LEN} characters"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StandardError::validation(
                "resource_id may only contain letters, digits, '_' and '-'",
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, input: FetchInput) -> Result<Value, JobError> {
        let url = self.record_url(&input)?;
        debug!(url = %url, "fetching external record");

        let response = send_with_retry(
            self.transport.as_ref(),
            &self.policy,
            Method::GET,
            url.as_str(),
            None,
            ctx.deadline,
        )
        .await
        .map_err(StandardError::from)?;

        let body = response
            .json()
            .unwrap_or_else(|_| Value::String(response.body.clone()));

        Ok(json!({
            "resource_id": input.resource_id,
            "status": response.status,
            "body": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RecordingAdapter, ReportedOutcome};
    use crate::handler::process_job;
    use crate::http::ReqwestTransport;
    use crate::state_machine::JobEnvelope;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handler(endpoint: &str, timeout: Duration) -> Arc<ExternalFetchHandler> {
        let transport = Arc::new(ReqwestTransport::new(None).unwrap());
        Arc::new(
            ExternalFetchHandler::new(
                transport,
                endpoint,
                RetryPolicy::new(2, 10),
                HandlerSettings {
                    timeout,
                    retry_budget: 2,
                },
            )
            .unwrap(),
        )
    }

    fn envelope(payload: Value) -> JobEnvelope {
        JobEnvelope::new(TASK_TYPE, payload.as_object().unwrap(), Duration::from_secs(5))
    }

    fn input(id: &str) -> FetchInput {
        FetchInput {
            resource_id: id.to_string(),
            query: None,
        }
    }

    #[test]
    fn resource_id_rules() {
        let h = handler("http://localhost/records", Duration::from_secs(1));
        assert!(h.validate(&input("abc_DEF-123")).is_ok());
        assert!(h.validate(&input("")).is_err());
        assert!(h.validate(&input("a/b")).is_err());
        assert!(h.validate(&input("héllo")).is_err());
        assert!(h.validate(&input(&"a".repeat(MAX_RESOURCE_ID_LEN + 1))).is_err());
    }

    #[test]
    fn record_url_appends_id_and_query() {
        let h = handler("http://localhost/api/records/", Duration::from_secs(1));
        let mut query = BTreeMap::new();
        query.insert("fields".to_string(), "name,owner".to_string());
        let url = h
            .record_url(&FetchInput {
                resource_id: "r-1".into(),
                query: Some(query),
            })
            .unwrap();
        assert_eq!(url.path(), "/api/records/r-1");
        assert_eq!(url.query(), Some("fields=name%2Cowner"));
    }

    #[test]
    fn rejects_unusable_endpoint() {
        let transport = Arc::new(ReqwestTransport::new(None).unwrap());
        let result = ExternalFetchHandler::new(
            transport,
            "not a url",
            RetryPolicy::default(),
            HandlerSettings::default(),
        );
        assert!(matches!(result, Err(WorkerError::Config(_))));
    }

    #[tokio::test]
    async fn fetches_record_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records/r1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/records/r1"))
            .and(query_param("view", "full"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "r1", "name": "Acme"})))
            .mount(&server)
            .await;

        let adapter = RecordingAdapter::new();
        let h = handler(&format!("{}/records", server.uri()), Duration::from_secs(5));
        let env = envelope(json!({"resource_id": "r1", "query": {"view": "full"}}));

        let report = process_job(h, env, &adapter).await;

        assert_eq!(report.outcome, "COMPLETED");
        match &adapter.outcomes()[..] {
            [ReportedOutcome::Complete { output, .. }] => {
                assert_eq!(output["resource_id"], "r1");
                assert_eq!(output["status"], 200);
                assert_eq!(output["body"]["name"], "Acme");
            }
            other => panic!("expected one Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persistent_errors_report_upstream_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let adapter = RecordingAdapter::new();
        let h = handler(&server.uri(), Duration::from_secs(5));
        let env = envelope(json!({"resource_id": "r1"})).with_remaining_retries(1);

        let report = process_job(h, env, &adapter).await;

        assert_eq!(report.outcome, "UPSTREAM_FAILURE");
        // Only one delivery left, so nothing more can be requested.
        assert_eq!(report.reported_retries, 0);
    }

    #[tokio::test]
    async fn silent_server_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let adapter = RecordingAdapter::new();
        let h = handler(&server.uri(), Duration::from_millis(100));
        let env = envelope(json!({"resource_id": "r1"}));
        let started = tokio::time::Instant::now();

        let report = process_job(h, env, &adapter).await;

        assert_eq!(report.outcome, "TIMEOUT");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            &adapter.outcomes()[..],
            [ReportedOutcome::Fail { code, retries: 2, .. }] if code == "TIMEOUT"
        ));
    }
}
