//! Test doubles shared by the connection and submission tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use agent_relay_core::{Message, SessionId};
use async_trait::async_trait;
use serde_json::Value;

use crate::api::{ApiError, SessionApi, SubmitRequest, SubmitResponse};

/// Scripted `SessionApi` that records calls.
#[derive(Default)]
pub(crate) struct MockApi {
    create_responses: Mutex<VecDeque<Result<SubmitResponse, u16>>>,
    create_requests: Mutex<Vec<SubmitRequest>>,
    replay_messages: Mutex<Vec<Message>>,
    replay_count: AtomicUsize,
    terminations: Mutex<Vec<(SessionId, bool)>>,
    answers: Mutex<Vec<(SessionId, Value)>>,
}

impl MockApi {
    pub(crate) fn push_create_ok(&self, session_id: &str) {
        self.create_responses
            .lock()
            .unwrap()
            .push_back(Ok(SubmitResponse {
                ok: true,
                session_id: Some(session_id.to_string()),
                error: None,
            }));
    }

    pub(crate) fn push_create_rejected(&self, error: &str) {
        self.create_responses
            .lock()
            .unwrap()
            .push_back(Ok(SubmitResponse {
                ok: false,
                session_id: None,
                error: Some(error.to_string()),
            }));
    }

    pub(crate) fn push_create_status(&self, status: u16) {
        self.create_responses.lock().unwrap().push_back(Err(status));
    }

    pub(crate) fn create_requests(&self) -> Vec<SubmitRequest> {
        self.create_requests.lock().unwrap().clone()
    }

    pub(crate) fn set_replay(&self, messages: Vec<Message>) {
        *self.replay_messages.lock().unwrap() = messages;
    }

    pub(crate) fn replay_calls(&self) -> usize {
        self.replay_count.load(Ordering::SeqCst)
    }

    pub(crate) fn terminations(&self) -> Vec<(SessionId, bool)> {
        self.terminations.lock().unwrap().clone()
    }

    pub(crate) fn answers(&self) -> Vec<(SessionId, Value)> {
        self.answers.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionApi for MockApi {
    async fn create(&self, request: &SubmitRequest) -> Result<SubmitResponse, ApiError> {
        self.create_requests.lock().unwrap().push(request.clone());
        match self.create_responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(status)) => Err(ApiError::Status(status)),
            None => panic!("unscripted create call"),
        }
    }

    async fn terminate(&self, session_id: &SessionId, reset: bool) -> Result<(), ApiError> {
        self.terminations
            .lock()
            .unwrap()
            .push((session_id.clone(), reset));
        Ok(())
    }

    async fn replay(&self, _session_id: &SessionId) -> Result<Vec<Message>, ApiError> {
        self.replay_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.replay_messages.lock().unwrap().clone())
    }

    async fn answer(&self, session_id: &SessionId, payload: &Value) -> Result<(), ApiError> {
        self.answers
            .lock()
            .unwrap()
            .push((session_id.clone(), payload.clone()));
        Ok(())
    }
}
