//! REST client for the scan node HTTP endpoints.
//!
//! Wraps engine listing, artifact submission and job polling using
//! [`reqwest`]. Transport failures are classified into timeouts and
//! unreachable nodes because the dispatcher treats them differently
//! from protocol errors.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;

use crate::messages::{ErrorBody, JobReport, SubmitResponse};

/// Header carrying the optional node API key.
pub const API_KEY_HEADER: &str = "apikey";

/// HTTP client for a single scan node.
#[derive(Debug, Clone)]
pub struct NodeApi {
    client: reqwest::Client,
    base_url: String,
}

/// State of a job as seen by one poll of `GET /file/<data_id>`.
#[derive(Debug, Clone)]
pub enum JobStatus {
    /// The node is still working on the job.
    Pending { progress: u32 },
    /// All engines finished.
    Complete(Box<JobReport>),
    /// The node answered 200 but without `scan_results.progress_percentage`.
    MissingProgress,
    /// The node answered with a non-200 status; the payload is passed
    /// through untouched.
    Rejected {
        status: u16,
        payload: serde_json::Value,
    },
}

/// Errors from the scan node REST layer.
#[derive(Debug, thiserror::Error)]
pub enum NodeApiError {
    /// The request did not complete within the client timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection refused, DNS failure, reset, or any other transport error.
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    /// The node returned a non-2xx status code.
    #[error("Node API error ({status}): {message}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Error message from the payload, or the raw body.
        message: String,
    },

    /// The body was not the JSON shape the protocol promises.
    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The HTTP client could not be configured.
    #[error("HTTP client configuration error: {0}")]
    Client(String),
}

impl From<reqwest::Error> for NodeApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_builder() {
            Self::Client(e.to_string())
        } else {
            Self::Unreachable(e.to_string())
        }
    }
}

/// Build the shared [`reqwest::Client`] used for every node.
///
/// The timeout applies to each request individually. When an API key is
/// configured it is attached to every request.
pub fn build_http_client(
    timeout: Duration,
    api_key: Option<&str>,
) -> Result<reqwest::Client, NodeApiError> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
        let value = HeaderValue::from_str(key)
            .map_err(|e| NodeApiError::Client(format!("invalid API key header: {e}")))?;
        headers.insert(API_KEY_HEADER, value);
    }

    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| NodeApiError::Client(e.to_string()))
}

impl NodeApi {
    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (connection pooling across all nodes).
    ///
    /// * `base_url` - e.g. `http://host:8008/`; a trailing slash is optional.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the raw engine list from `GET /stat/engines`.
    ///
    /// The body is returned as text because its shape depends on the
    /// peer protocol version.
    pub async fn engines(&self) -> Result<String, NodeApiError> {
        let response = self
            .client
            .get(format!("{}/stat/engines", self.base_url))
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.text().await?)
    }

    /// Submit an artifact for scanning.
    ///
    /// Sends the raw bytes as the body of `POST /file` and returns the
    /// node-issued job token.
    pub async fn submit(&self, artifact: Vec<u8>) -> Result<SubmitResponse, NodeApiError> {
        let response = self
            .client
            .post(format!("{}/file", self.base_url))
            .body(artifact)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Poll a job once via `GET /file/<data_id>`.
    pub async fn job_status(&self, data_id: &str) -> Result<JobStatus, NodeApiError> {
        let response = self
            .client
            .get(format!("{}/file/{}", self.base_url, data_id))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        classify_job_status(status, &body)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. On failure the
    /// error message is taken from the payload when it has one.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, NodeApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(body);

        Err(NodeApiError::ApiError {
            status: status.as_u16(),
            message,
        })
    }
}

/// Interpret one poll response.
///
/// Non-200 answers are passed through as [`JobStatus::Rejected`] rather
/// than errors; the caller decides what an unexpected payload means.
pub fn classify_job_status(status: StatusCode, body: &str) -> Result<JobStatus, NodeApiError> {
    if status != StatusCode::OK {
        let payload = serde_json::from_str(body)
            .unwrap_or_else(|_| serde_json::Value::String(body.to_string()));
        return Ok(JobStatus::Rejected {
            status: status.as_u16(),
            payload,
        });
    }

    let value: serde_json::Value = serde_json::from_str(body)?;
    let Some(progress) = value
        .pointer("/scan_results/progress_percentage")
        .and_then(progress_value)
    else {
        return Ok(JobStatus::MissingProgress);
    };

    if progress >= 100 {
        let report: JobReport = serde_json::from_value(value)?;
        Ok(JobStatus::Complete(Box::new(report)))
    } else {
        Ok(JobStatus::Pending {
            progress: progress as u32,
        })
    }
}

/// Progress as a whole percentage. Some nodes report it as a float.
fn progress_value(value: &serde_json::Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|p| p.is_finite() && *p >= 0.0)
            .map(|p| p as u64)
    })
}
