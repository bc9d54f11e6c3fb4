//! Session HTTP endpoints.

use agent_relay_core::{Message, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// API error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(u16),
}

/// `POST /sessions` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_running: Option<bool>,
}

/// `POST /sessions` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub ok: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TerminateRequest {
    reset_session: bool,
}

#[derive(Debug, Deserialize)]
struct ReplayResponse {
    messages: Vec<Message>,
}

/// Session management endpoints, seamed for tests.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Create or continue a session.
    async fn create(&self, request: &SubmitRequest) -> Result<SubmitResponse, ApiError>;

    /// Terminate a session, optionally resetting its server-side record.
    async fn terminate(&self, session_id: &SessionId, reset: bool) -> Result<(), ApiError>;

    /// Fetch the durable transcript for background reconciliation.
    async fn replay(&self, session_id: &SessionId) -> Result<Vec<Message>, ApiError>;

    /// Answer a pending question.
    async fn answer(&self, session_id: &SessionId, payload: &Value) -> Result<(), ApiError>;
}

/// `SessionApi` over HTTP.
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionApi {
    /// Create a client for the given server base URL.
    #[must_use]
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create(&self, request: &SubmitRequest) -> Result<SubmitResponse, ApiError> {
        let response = self
            .client
            .post(self.url("/sessions"))
            .json(request)
            .send()
            .await?;
        // A non-2xx submission still carries an `ok: false` body worth
        // surfacing; fall back to the status when it does not parse.
        let status = response.status();
        match response.json::<SubmitResponse>().await {
            Ok(body) => Ok(body),
            Err(_) if !status.is_success() => Err(ApiError::Status(status.as_u16())),
            Err(e) => Err(ApiError::Request(e)),
        }
    }

    async fn terminate(&self, session_id: &SessionId, reset: bool) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{session_id}/terminate")))
            .json(&TerminateRequest {
                reset_session: reset,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn replay(&self, session_id: &SessionId) -> Result<Vec<Message>, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/sessions/{session_id}/messages")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        let body: ReplayResponse = response.json().await?;
        Ok(body.messages)
    }

    async fn answer(&self, session_id: &SessionId, payload: &Value) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{session_id}/input")))
            .json(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
