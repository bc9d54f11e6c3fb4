//! Prompt submission and the client facade.
//!
//! A submission echoes the user's message into the store before the
//! server responds, so the transcript never feels laggy. A brand-new
//! session lives under a provisional id until the create response (or a
//! lifecycle envelope on the stream) supplies the durable one; the store
//! entry is then rekeyed in place.

use std::sync::Arc;

use agent_relay_core::{Role, SessionId, SessionStore, StoreError};
use thiserror::Error;

use crate::api::{ApiError, HttpSessionApi, SessionApi, SubmitRequest};
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::transport::{HttpStreamTransport, StreamTransport};

/// Client-facing error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The server answered but refused the submission.
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-submission knobs.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub provider: String,
    pub model: String,
    pub permission_mode: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    /// Replace a run already in flight instead of refusing.
    pub replace_running: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            provider: "claude".to_string(),
            model: "sonnet".to_string(),
            permission_mode: None,
            allowed_tools: None,
            replace_running: false,
        }
    }
}

/// The client facade: session store, HTTP endpoints, and the single
/// live stream connection, wired together.
pub struct RelayClient {
    store: Arc<SessionStore>,
    api: Arc<dyn SessionApi>,
    connection: ConnectionManager,
}

impl RelayClient {
    /// Build a client talking HTTP to `config.base_url`.
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        let api: Arc<dyn SessionApi> = Arc::new(HttpSessionApi::new(config.base_url.clone()));
        let transport: Arc<dyn StreamTransport> =
            Arc::new(HttpStreamTransport::new(config.base_url.clone()));
        Self::with_parts(Arc::new(SessionStore::new()), api, transport, config)
    }

    /// Build a client from injected parts. Tests use this with scripted
    /// fakes.
    #[must_use]
    pub fn with_parts(
        store: Arc<SessionStore>,
        api: Arc<dyn SessionApi>,
        transport: Arc<dyn StreamTransport>,
        config: &ClientConfig,
    ) -> Self {
        let connection = ConnectionManager::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&api),
            config.retry.clone(),
            config.flush_interval,
        );
        Self {
            store,
            api,
            connection,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Submit a prompt, creating a session when `session` is `None`.
    ///
    /// The user message is appended optimistically before the request
    /// goes out. On success the (possibly rekeyed) session is marked
    /// running and handed to the connection manager. On failure the
    /// message stays in the transcript, the status reverts to idle, and
    /// nothing retries automatically.
    pub async fn submit(
        &self,
        prompt: &str,
        session: Option<&SessionId>,
        options: &SubmitOptions,
    ) -> Result<SessionId, ClientError> {
        let target = match session {
            Some(id) => {
                self.store.append_message(id, Role::User, prompt);
                id.clone()
            }
            None => {
                let provisional = SessionId::provisional();
                self.store.touch(&provisional);
                self.store.push_pending_user(prompt);
                self.store.merge_pending_into(&provisional);
                provisional
            }
        };
        self.store.begin_turn(&target);

        let request = SubmitRequest {
            prompt: prompt.to_string(),
            session_id: session.map(|s| s.as_str().to_string()),
            provider: options.provider.clone(),
            model: options.model.clone(),
            permission_mode: options.permission_mode.clone(),
            allowed_tools: options.allowed_tools.clone(),
            replace_running: options.replace_running.then_some(true),
        };

        let response = match self.api.create(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(session = %target, error = %e, "submission failed");
                self.store.revert_to_idle(&target);
                return Err(e.into());
            }
        };
        if !response.ok {
            let reason = response.error.unwrap_or_else(|| "unspecified".to_string());
            tracing::warn!(session = %target, reason, "submission rejected");
            self.store.revert_to_idle(&target);
            return Err(ClientError::Rejected(reason));
        }

        let final_id = match response.session_id {
            Some(durable) => SessionId::durable(durable),
            None => target.clone(),
        };
        if final_id != target {
            self.store.rekey(&target, &final_id);
        }
        self.store.merge_pending_into(&final_id);
        self.store.mark_running(&final_id);
        self.connection.sync_target(Some(&final_id), true).await;
        Ok(final_id)
    }

    /// Answer the session's pending question and resume the run.
    pub async fn answer(&self, session: &SessionId, answer: &str) -> Result<(), ClientError> {
        let question = self.store.take_pending_question(session);
        let payload = serde_json::json!({
            "answer": answer,
            "toolUseId": question.as_ref().and_then(|q| q.tool_use_id.clone()),
        });
        if let Err(e) = self.api.answer(session, &payload).await {
            // Keep the question visible when the answer did not land.
            if let Some(question) = question {
                self.store.set_pending_question(session, question);
            }
            return Err(e.into());
        }
        self.store.mark_running(session);
        Ok(())
    }

    /// Terminate the session's run. With `reset` the server-side record
    /// and the local entry are dropped entirely.
    pub async fn terminate(&self, session: &SessionId, reset: bool) -> Result<(), ClientError> {
        if self.connection.current_session().await.as_ref() == Some(session) {
            self.connection.shutdown().await;
        }
        self.api.terminate(session, reset).await?;
        if reset {
            self.store.remove(session);
        } else {
            self.store.revert_to_idle(session);
        }
        Ok(())
    }

    /// Point the live connection at the session the UI shows, if it is
    /// running, and close it otherwise.
    pub async fn sync_connection(&self) {
        let displayed = self.store.displayed();
        let running = displayed
            .as_ref()
            .and_then(|id| self.store.run_status(id))
            .is_some_and(|status| status != agent_relay_core::RunStatus::Idle);
        self.connection.sync_target(displayed.as_ref(), running).await;
    }
}
