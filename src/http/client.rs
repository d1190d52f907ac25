use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::time::Instant;

use super::error::HttpError;
use crate::retry::{RetryError, RetryPolicy, with_retry};

/// Status and raw body of an outbound response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON; an empty body is `null`.
    pub fn json(&self) -> Result<Value, HttpError> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|e| HttpError::Decode(e.to_string()))
    }
}

/// Issue one HTTP request that must finish before `deadline`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        deadline: Instant,
    ) -> Result<HttpResponse, HttpError>;
}

/// [`HttpTransport`] backed by a shared `reqwest` client.
pub struct ReqwestTransport {
    client: Client,
    api_key: Option<String>,
}

impl ReqwestTransport {
    pub fn new(api_key: Option<String>) -> Result<Self, HttpError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        deadline: Instant,
    ) -> Result<HttpResponse, HttpError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HttpError::Timeout);
        }

        let mut request = self.client.request(method, url).timeout(remaining);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

/// Send a request through [`with_retry`]; non-2xx responses consume an attempt.
pub async fn send_with_retry(
    transport: &dyn HttpTransport,
    policy: &RetryPolicy,
    method: Method,
    url: &str,
    body: Option<&Value>,
    deadline: Instant,
) -> Result<HttpResponse, RetryError<HttpError>> {
    with_retry(policy, deadline, |_| {
        let method = method.clone();
        async move {
            let response = transport.request(method, url, body, deadline).await?;
            if response.is_success() {
                Ok(response)
            } else {
                Err(HttpError::Status {
                    status: response.status,
                    body: response.body,
                })
            }
        }
    })
    .await
}
