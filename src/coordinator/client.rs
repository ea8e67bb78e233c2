//! HTTP client for the master API
//!
//! Used by remote workers and by the `submit` CLI command.

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::error::Error;
use crate::models::{AssignedTask, Assignment, Device, DeviceRegistration, HeartbeatMetrics, Task};
use crate::scheduler::dispatcher::{DispatchStats, ReportAck, StatusReport, SubmitTask};

use super::api::{ApiResponse, DevicesResponse, ForceDispatchRequest};

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the master client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Master base URL
    pub master_url: String,

    /// Request timeout
    pub timeout: Duration,

    /// Retry count for transient failures
    pub retry_count: u32,

    /// Retry delay
    pub retry_delay: Duration,
}

impl ClientConfig {
    pub fn new(master_url: impl Into<String>) -> Self {
        Self {
            master_url: master_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            retry_count: 2,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

// ============================================================================
// Master Client
// ============================================================================

/// Client for communicating with the master
pub struct MasterClient {
    config: ClientConfig,
    http_client: Client,
}

impl MasterClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::InitError(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.master_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/distribution{}", self.config.master_url, path)
    }

    pub async fn register(&self, registration: &DeviceRegistration) -> Result<Device, ClientError> {
        self.send_with_retry(Method::POST, &self.url("/devices/register"), Some(registration))
            .await
    }

    pub async fn heartbeat(
        &self,
        device_id: &str,
        metrics: &HeartbeatMetrics,
    ) -> Result<Device, ClientError> {
        let url = self.url(&format!("/devices/{device_id}/heartbeat"));
        self.send_with_retry(Method::POST, &url, Some(metrics)).await
    }

    pub async fn list_devices(&self) -> Result<DevicesResponse, ClientError> {
        self.send_with_retry::<(), _>(Method::GET, &self.url("/devices"), None)
            .await
    }

    pub async fn available_devices(
        &self,
        capability: Option<&str>,
    ) -> Result<Vec<Device>, ClientError> {
        let mut url = self.url("/devices/available");
        if let Some(cap) = capability {
            url.push_str(&format!("?capability={cap}"));
        }
        self.send_with_retry::<(), _>(Method::GET, &url, None).await
    }

    pub async fn pull_tasks(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<AssignedTask>, ClientError> {
        let url = self.url(&format!("/tasks/{device_id}/pull?limit={limit}"));
        self.send_with_retry::<(), _>(Method::GET, &url, None).await
    }

    /// Single attempt; callers wrap reports in their own retry policy
    pub async fn report_status(&self, report: &StatusReport) -> Result<ReportAck, ClientError> {
        self.send_once(Method::PUT, &self.url("/tasks/status"), Some(report))
            .await
    }

    pub async fn submit_task(&self, request: &SubmitTask) -> Result<Task, ClientError> {
        self.send_with_retry(Method::POST, &self.url("/tasks"), Some(request))
            .await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task, ClientError> {
        let url = self.url(&format!("/tasks/{task_id}"));
        self.send_with_retry::<(), _>(Method::GET, &url, None).await
    }

    pub async fn force_dispatch(
        &self,
        task_id: i64,
        device_id: &str,
    ) -> Result<Assignment, ClientError> {
        let request = ForceDispatchRequest {
            task_id,
            device_id: device_id.to_string(),
        };
        self.send_with_retry(Method::POST, &self.url("/tasks/assign"), Some(&request))
            .await
    }

    pub async fn stats(&self) -> Result<DispatchStats, ClientError> {
        self.send_with_retry::<(), _>(Method::GET, &self.url("/stats/overview"), None)
            .await
    }

    /// True when the master answers its liveness probe
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health/live", self.config.master_url);
        matches!(
            self.http_client.get(&url).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    // Internal: retry transient failures, return client errors immediately
    async fn send_with_retry<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<R, ClientError> {
        let mut last_error = None;

        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            match self.send_once(method.clone(), url, body).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() => {
                    tracing::debug!(url, attempt, error = %e, "Master request failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ClientError::MasterUnavailable))
    }

    async fn send_once<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<R, ClientError> {
        let mut request = self.http_client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&text)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(text);
            return Err(ClientError::HttpError {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ApiResponse<R> =
            serde_json::from_str(&text).map_err(|e| ClientError::ParseError(e.to_string()))?;
        if !envelope.success {
            return Err(ClientError::InvalidResponse(
                envelope.error.unwrap_or_else(|| "request failed".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| ClientError::InvalidResponse("missing data".to_string()))
    }
}

// ============================================================================
// Client Errors
// ============================================================================

/// Client errors
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Initialization error
    InitError(String),

    /// Network error
    NetworkError(String),

    /// HTTP error
    HttpError { status: u16, message: String },

    /// Parse error
    ParseError(String),

    /// Invalid response
    InvalidResponse(String),

    /// Master unavailable
    MasterUnavailable,
}

impl ClientError {
    /// Network failures and 5xx answers are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::MasterUnavailable => true,
            Self::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitError(msg) => write!(f, "Initialization error: {msg}"),
            Self::NetworkError(msg) => write!(f, "Network error: {msg}"),
            Self::HttpError { status, message } => {
                write!(f, "HTTP error ({status}): {message}")
            }
            Self::ParseError(msg) => write!(f, "Parse error: {msg}"),
            Self::InvalidResponse(msg) => write!(f, "Invalid response: {msg}"),
            Self::MasterUnavailable => write!(f, "Master unavailable"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::HttpError { status: 400, message } => Error::Validation(message),
            ClientError::HttpError { status: 404, message } => Error::NotFound {
                kind: "remote resource",
                id: message,
            },
            ClientError::InitError(msg) => Error::Configuration(msg),
            ClientError::ParseError(msg) | ClientError::InvalidResponse(msg) => {
                Error::Network(format!("bad response from master: {msg}"))
            }
            other => Error::Network(other.to_string()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
