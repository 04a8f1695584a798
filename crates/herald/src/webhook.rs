//! HTTP delivery of due jobs.
//!
//! Each attempt is a JSON `POST` of the job to a single publish endpoint.
//! A 2xx response completes the job with the response body as its result.
//! Anything else becomes a [`ProviderError`] for the classifier.

use std::time::Duration;

use herald_queue::{Job, JobHandler, handler_fn};
use herald_resilience::ProviderError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Request body sent for every attempt.
#[derive(Debug, Serialize)]
struct DeliveryRequest<'a> {
    id: &'a str,
    key: &'a str,
    attempt: u32,
    payload: &'a Value,
}

/// Optional structured error body returned by the endpoint.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    platform: Option<String>,
}

/// Posts job payloads to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    http: Client,
    url: String,
}

impl WebhookPublisher {
    /// Create a publisher with the given per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Deliver one attempt of `job`.
    pub async fn publish(&self, job: &Job) -> Result<Value, ProviderError> {
        let body = DeliveryRequest {
            id: job.id.as_str(),
            key: &job.key,
            attempt: job.attempt,
            payload: &job.payload,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(job, &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(job, &e))?;

        if status.is_success() {
            debug!(key = %job.key, %status, "delivered");
            return Ok(parse_result(&text));
        }

        Err(status_error(job, status.as_u16(), &text))
    }

    /// Wrap this publisher as a dispatcher handler.
    pub fn handler(self) -> JobHandler {
        handler_fn(move |job| {
            let publisher = self.clone();
            async move { publisher.publish(&job).await }
        })
    }
}

/// Response body as a result value: JSON if it parses, else the raw text.
fn parse_result(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Map a non-2xx response onto a provider error.
///
/// A structured body overrides the status code; the job's platform fills in
/// when the body names none.
fn status_error(job: &Job, status: u16, text: &str) -> ProviderError {
    let parsed = serde_json::from_str::<ErrorBody>(text)
        .ok()
        .filter(|body| body.code.is_some() || body.message.is_some());

    let (code, message, platform) = match parsed {
        Some(body) => {
            let code = match body.code {
                Some(Value::String(code)) => code,
                Some(Value::Number(code)) => code.to_string(),
                _ => status.to_string(),
            };
            (code, body.message.unwrap_or_default(), body.platform)
        }
        None => (status.to_string(), text.trim().to_string(), None),
    };

    ProviderError {
        platform: platform.or_else(|| job.platform.clone()),
        code,
        message,
    }
}

/// Map a transport failure onto one of the generic transient codes.
fn transport_error(job: &Job, error: &reqwest::Error) -> ProviderError {
    let code = if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "econnrefused"
    } else {
        "network-error"
    };

    ProviderError {
        platform: job.platform.clone(),
        code: code.to_string(),
        message: error.to_string(),
    }
}
