//! In-memory session store with render-notification broadcast.
//!
//! Single source of truth for every session's live state. Entries are
//! created lazily on first touch and removed only by explicit reset or
//! terminate. Mutations to a session that is not currently displayed are
//! still applied, but no notification reaches the rendering layer until
//! that session is displayed again.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::id::SessionId;
use crate::message::{IdMinter, Message, Role, dedupe_ids};
use crate::session::{
    PendingQuestion, PermissionDenial, RunStatus, SessionState, ToolActivity,
};

/// Store error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A replay merge was attempted while a draft is in flight. The draft
    /// is strictly newer than anything on disk.
    #[error("session {0} has an in-flight draft; refusing history merge")]
    DraftInProgress(SessionId),
}

/// Notification pushed toward the rendering layer.
///
/// Only emitted for the displayed session; a `Displayed` change is the
/// renderer's cue to re-read the newly displayed transcript in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUpdate {
    /// The displayed session's transcript or draft changed.
    Transcript { session_id: SessionId },
    /// The displayed session's run status changed.
    Status {
        session_id: SessionId,
        status: RunStatus,
    },
    /// The displayed session changed.
    Displayed { session_id: Option<SessionId> },
    /// The displayed session has a pending question or new denials.
    Attention { session_id: SessionId },
    /// The displayed session exceeded its retry budget.
    Disconnected { session_id: SessionId },
}

struct Inner {
    sessions: HashMap<SessionId, SessionState>,
    displayed: Option<SessionId>,
    /// Optimistic user messages queued before any session id exists.
    pending: Vec<Message>,
}

/// In-memory map from session id to live session state.
pub struct SessionStore {
    inner: RwLock<Inner>,
    minter: IdMinter,
    updates: broadcast::Sender<StoreUpdate>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                displayed: None,
                pending: Vec::new(),
            }),
            minter: IdMinter::new(),
            updates,
        }
    }

    /// Subscribe to render notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    /// The store-local message id minter.
    #[must_use]
    pub fn minter(&self) -> &IdMinter {
        &self.minter
    }

    fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionState, &IdMinter) -> R,
    ) -> R {
        let mut inner = self.inner.write().unwrap();
        let state = inner.sessions.entry(id.clone()).or_default();
        f(state, &self.minter)
    }

    fn notify(&self, id: &SessionId, update: StoreUpdate) {
        let displayed = self.inner.read().unwrap().displayed.clone();
        if displayed.as_ref() == Some(id) {
            let _ = self.updates.send(update);
        }
    }

    /// Ensure a session entry exists.
    pub fn touch(&self, id: &SessionId) {
        self.with_session(id, |_, _| ());
    }

    /// Whether an entry exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.read().unwrap().sessions.contains_key(id)
    }

    /// Ids of every known session, in no particular order.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionId> {
        self.inner.read().unwrap().sessions.keys().cloned().collect()
    }

    /// Remove a session entry. Explicit reset/terminate only.
    pub fn remove(&self, id: &SessionId) {
        let mut inner = self.inner.write().unwrap();
        inner.sessions.remove(id);
        if inner.displayed.as_ref() == Some(id) {
            inner.displayed = None;
            drop(inner);
            let _ = self.updates.send(StoreUpdate::Displayed { session_id: None });
        }
    }

    // ------------------------------------------------------------------
    // Displayed session
    // ------------------------------------------------------------------

    /// Change which session is displayed.
    pub fn set_displayed(&self, id: Option<SessionId>) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.displayed == id {
                return;
            }
            inner.displayed = id.clone();
        }
        let _ = self.updates.send(StoreUpdate::Displayed { session_id: id });
    }

    /// The currently displayed session, if any.
    #[must_use]
    pub fn displayed(&self) -> Option<SessionId> {
        self.inner.read().unwrap().displayed.clone()
    }

    /// Whether `id` is the displayed session.
    #[must_use]
    pub fn is_displayed(&self, id: &SessionId) -> bool {
        self.inner.read().unwrap().displayed.as_ref() == Some(id)
    }

    // ------------------------------------------------------------------
    // Transcript mutation
    // ------------------------------------------------------------------

    /// Append a stable message. Returns the minted message id.
    pub fn append_message(&self, id: &SessionId, role: Role, content: impl Into<String>) -> String {
        let msg_id = self.with_session(id, |s, m| s.append_message(m, role, content));
        self.notify(
            id,
            StoreUpdate::Transcript {
                session_id: id.clone(),
            },
        );
        msg_id
    }

    /// Extend the session's draft with streamed assistant text.
    ///
    /// The mutation is always applied; render notification is left to the
    /// caller's flush throttle (`notify_transcript`).
    pub fn append_assistant_delta(&self, id: &SessionId, text: &str) {
        self.with_session(id, |s, m| s.append_assistant_delta(m, text));
    }

    /// Push a transcript notification for the displayed session.
    pub fn notify_transcript(&self, id: &SessionId) {
        self.notify(
            id,
            StoreUpdate::Transcript {
                session_id: id.clone(),
            },
        );
    }

    /// Finalize the session's draft and go idle.
    pub fn finalize(&self, id: &SessionId) {
        self.with_session(id, |s, _| s.finalize());
        self.notify(
            id,
            StoreUpdate::Status {
                session_id: id.clone(),
                status: RunStatus::Idle,
            },
        );
        self.notify_transcript(id);
    }

    /// Mark a new turn running.
    pub fn begin_turn(&self, id: &SessionId) {
        self.with_session(id, |s, _| s.begin_turn());
        self.notify(
            id,
            StoreUpdate::Status {
                session_id: id.clone(),
                status: RunStatus::Running,
            },
        );
    }

    /// Mark running unless the current turn already completed.
    pub fn mark_running(&self, id: &SessionId) {
        self.with_session(id, |s, _| s.mark_running());
    }

    /// Revert to idle without finalizing (failed submission).
    pub fn revert_to_idle(&self, id: &SessionId) {
        self.with_session(id, |s, _| s.run_status = RunStatus::Idle);
        self.notify(
            id,
            StoreUpdate::Status {
                session_id: id.clone(),
                status: RunStatus::Idle,
            },
        );
    }

    /// Current run status, if the session exists.
    #[must_use]
    pub fn run_status(&self, id: &SessionId) -> Option<RunStatus> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(id)
            .map(|s| s.run_status)
    }

    /// Snapshot of the session's messages and draft.
    #[must_use]
    pub fn transcript(&self, id: &SessionId) -> Option<(Vec<Message>, String)> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(id)
            .map(|s| (s.messages.clone(), s.draft.clone()))
    }

    /// Whether the session has an in-flight draft.
    #[must_use]
    pub fn has_draft(&self, id: &SessionId) -> bool {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(id)
            .is_some_and(SessionState::has_draft)
    }

    // ------------------------------------------------------------------
    // Rekey
    // ------------------------------------------------------------------

    /// Move a session's state from `old` to `new` in place.
    ///
    /// No-op when the ids are equal or `old` has no entry (a duplicate
    /// lifecycle envelope is a race, not an error). If `new` already has
    /// an entry, `old`'s messages are appended after it and ids deduped.
    pub fn rekey(&self, old: &SessionId, new: &SessionId) {
        if old == new {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let Some(moved) = inner.sessions.remove(old) else {
            return;
        };
        tracing::debug!(from = %old, to = %new, "rekeying session entry");

        match inner.sessions.remove(new) {
            Some(mut existing) => {
                let mut merged = existing.messages;
                merged.extend(moved.messages);
                existing.messages = dedupe_ids(&self.minter, merged);
                existing.draft = if moved.draft.is_empty() {
                    existing.draft
                } else {
                    moved.draft
                };
                existing.run_status = moved.run_status;
                inner.sessions.insert(new.clone(), existing);
            }
            None => {
                inner.sessions.insert(new.clone(), moved);
            }
        }

        if inner.displayed.as_ref() == Some(old) {
            inner.displayed = Some(new.clone());
            drop(inner);
            let _ = self.updates.send(StoreUpdate::Displayed {
                session_id: Some(new.clone()),
            });
        }
    }

    // ------------------------------------------------------------------
    // Pending (pre-session) queue
    // ------------------------------------------------------------------

    /// Queue an optimistic user message before any session id exists.
    pub fn push_pending_user(&self, content: impl Into<String>) -> Message {
        let msg = Message::new(self.minter.next_id(), Role::User, content);
        self.inner.write().unwrap().pending.push(msg.clone());
        msg
    }

    /// Merge all queued pending messages into `id`, deduplicating ids.
    pub fn merge_pending_into(&self, id: &SessionId) {
        let pending = std::mem::take(&mut self.inner.write().unwrap().pending);
        if pending.is_empty() {
            return;
        }
        self.with_session(id, |s, m| {
            let mut merged = std::mem::take(&mut s.messages);
            merged.extend(pending);
            s.messages = dedupe_ids(m, merged);
        });
        self.notify_transcript(id);
    }

    /// Snapshot of the pending queue.
    #[must_use]
    pub fn pending(&self) -> Vec<Message> {
        self.inner.read().unwrap().pending.clone()
    }

    // ------------------------------------------------------------------
    // Replay reconciliation
    // ------------------------------------------------------------------

    /// Replace the transcript with server-returned history.
    ///
    /// # Errors
    /// Refused while a draft is in flight; the draft is strictly newer.
    pub fn merge_history(&self, id: &SessionId, history: Vec<Message>) -> Result<(), StoreError> {
        let replaced = self.with_session(id, |s, m| {
            if s.has_draft() {
                return Err(StoreError::DraftInProgress(id.clone()));
            }
            s.messages = dedupe_ids(m, history);
            Ok(())
        });
        replaced?;
        self.notify_transcript(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stream carry-over
    // ------------------------------------------------------------------

    /// Feed a raw chunk to the session's carry-over line buffer.
    pub fn feed_chunk(&self, id: &SessionId, chunk: &str) -> Vec<String> {
        self.with_session(id, |s, _| s.output_carry.feed(chunk))
    }

    /// Drain the final partial line on stream end.
    pub fn flush_carry(&self, id: &SessionId) -> Option<String> {
        self.with_session(id, |s, _| s.output_carry.flush())
    }

    // ------------------------------------------------------------------
    // Attention state
    // ------------------------------------------------------------------

    /// Merge a denial list for the session.
    pub fn set_denials(&self, id: &SessionId, denials: Vec<PermissionDenial>) {
        self.with_session(id, |s, _| s.set_denials(denials));
        self.notify(
            id,
            StoreUpdate::Attention {
                session_id: id.clone(),
            },
        );
    }

    /// Clear denials (dismissed by the user).
    pub fn clear_denials(&self, id: &SessionId) {
        self.with_session(id, |s, _| s.permission_denials.clear());
    }

    /// Set the pending question and mark the session waiting for input.
    pub fn set_pending_question(&self, id: &SessionId, question: PendingQuestion) {
        self.with_session(id, |s, _| {
            s.pending_question = Some(question);
            s.run_status = RunStatus::WaitingForInput;
        });
        self.notify(
            id,
            StoreUpdate::Attention {
                session_id: id.clone(),
            },
        );
        self.notify(
            id,
            StoreUpdate::Status {
                session_id: id.clone(),
                status: RunStatus::WaitingForInput,
            },
        );
    }

    /// Take the pending question (answered or dismissed).
    pub fn take_pending_question(&self, id: &SessionId) -> Option<PendingQuestion> {
        self.with_session(id, |s, _| s.pending_question.take())
    }

    /// Record the currently executing tool.
    pub fn set_activity(&self, id: &SessionId, activity: Option<ToolActivity>) {
        self.with_session(id, |s, _| s.current_activity = activity);
    }

    /// Consume the recorded tool activity.
    pub fn take_activity(&self, id: &SessionId) -> Option<ToolActivity> {
        self.with_session(id, |s, _| s.current_activity.take())
    }

    /// Record run metadata from a lifecycle envelope.
    pub fn set_run_metadata(
        &self,
        id: &SessionId,
        permission_mode: Option<String>,
        allowed_tools: Vec<String>,
    ) {
        self.with_session(id, |s, _| {
            if permission_mode.is_some() {
                s.permission_mode = permission_mode;
            }
            if !allowed_tools.is_empty() {
                s.allowed_tools = allowed_tools;
            }
        });
    }

    // ------------------------------------------------------------------
    // Failure surfaces
    // ------------------------------------------------------------------

    /// Mark the session disconnected after the retry cap. The transcript
    /// is preserved.
    pub fn mark_disconnected(&self, id: &SessionId) {
        tracing::warn!(session = %id, "session stream lost");
        self.with_session(id, |s, _| {
            s.disconnected = true;
            s.run_status = RunStatus::Idle;
        });
        self.notify(
            id,
            StoreUpdate::Disconnected {
                session_id: id.clone(),
            },
        );
    }

    /// Whether the session lost its stream past the retry cap.
    #[must_use]
    pub fn is_disconnected(&self, id: &SessionId) -> bool {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(id)
            .is_some_and(|s| s.disconnected)
    }

    /// Record whether the stream ended abnormally (non-zero exit code).
    pub fn set_terminated_abnormally(&self, id: &SessionId, abnormal: bool) {
        self.with_session(id, |s, _| s.last_terminated_abnormally = abnormal);
    }

    /// Whether the session's last stream ended abnormally.
    #[must_use]
    pub fn terminated_abnormally(&self, id: &SessionId) -> bool {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(id)
            .is_some_and(|s| s.last_terminated_abnormally)
    }
}
