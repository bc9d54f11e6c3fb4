//! Per-session live state and transcript assembly.

use serde::{Deserialize, Serialize};

use crate::message::{IdMinter, Message, Role};
use crate::sanitize::{LineBuffer, sanitize_fragment, trim_partial_trailing_tag};

/// Run status of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No turn in progress.
    #[default]
    Idle,
    /// Agent is producing output.
    Running,
    /// Agent asked a question and is blocked on an answer.
    WaitingForInput,
}

/// A denied tool invocation, deduplicated by `(tool_name, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDenial {
    pub tool_name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PermissionDenial {
    /// Dedup key for merging denial lists.
    #[must_use]
    pub fn key(&self) -> (String, Option<String>) {
        (self.tool_name.clone(), self.path.clone())
    }
}

/// A pending multi-choice question from the agent. At most one per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

/// Metadata for a tool currently executing, recorded on tool start and
/// consumed on tool end to render a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolActivity {
    pub tool_name: String,
    pub target: Option<String>,
}

/// Live state for one session.
///
/// Created lazily on first touch; removed only by explicit reset,
/// new-session, or terminate - never by connection close or a displayed
/// session switch.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Ordered transcript.
    pub messages: Vec<Message>,
    /// Assistant text accumulated for the current turn, not yet finalized.
    pub draft: String,
    /// Id of the in-progress assistant message backing the draft.
    draft_message_id: Option<String>,
    pub run_status: RunStatus,
    /// Partial last line of the raw byte stream.
    pub output_carry: LineBuffer,
    pub last_terminated_abnormally: bool,
    /// Latched when end-of-run is observed; guards against a trailing
    /// chunk re-marking the session as running after logical completion.
    turn_complete: bool,
    /// Set after the retry cap is exceeded; transcript is preserved.
    pub disconnected: bool,
    pub current_activity: Option<ToolActivity>,
    pub permission_denials: Vec<PermissionDenial>,
    pub pending_question: Option<PendingQuestion>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
}

impl SessionState {
    /// Create an empty idle session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn: mark running and clear per-turn latches.
    pub fn begin_turn(&mut self) {
        self.run_status = RunStatus::Running;
        self.turn_complete = false;
        self.last_terminated_abnormally = false;
        self.disconnected = false;
    }

    /// Append a stable message, minting the next local id. Returns the id.
    pub fn append_message(
        &mut self,
        minter: &IdMinter,
        role: Role,
        content: impl Into<String>,
    ) -> String {
        let msg = Message::new(minter.next_id(), role, content);
        let id = msg.id.clone();
        self.messages.push(msg);
        id
    }

    /// Extend the draft with streamed assistant text.
    ///
    /// The transcript never shows more than one in-progress assistant
    /// message: if the trailing message is an assistant message its
    /// content is replaced with the full draft, otherwise a new assistant
    /// message seeded with the draft is appended.
    pub fn append_assistant_delta(&mut self, minter: &IdMinter, text: &str) {
        let clean = sanitize_fragment(text);
        if clean.is_empty() {
            return;
        }
        self.draft.push_str(&clean);

        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content = self.draft.clone();
                self.draft_message_id = Some(last.id.clone());
            }
            _ => {
                let msg = Message::new(minter.next_id(), Role::Assistant, self.draft.clone());
                self.draft_message_id = Some(msg.id.clone());
                self.messages.push(msg);
            }
        }

        // A trailing chunk can arrive after logical completion; it must
        // not resurrect the running state.
        if !self.turn_complete {
            self.run_status = RunStatus::Running;
        }
    }

    /// Convert the draft into a stable message and go idle. Idempotent.
    ///
    /// The draft, not the last-flushed message content, is the source of
    /// truth: a non-assistant message inserted mid-stream forces a new
    /// assistant message seeded with the full draft, and finalize syncs
    /// the trailing message to the cleaned draft unconditionally.
    pub fn finalize(&mut self) {
        let cleaned = trim_partial_trailing_tag(&self.draft).trim_end().to_string();

        if let Some(id) = self.draft_message_id.take() {
            if cleaned.is_empty() {
                if self.messages.last().is_some_and(|m| m.id == id) {
                    self.messages.pop();
                }
            } else if let Some(msg) = self.messages.iter_mut().rev().find(|m| m.id == id) {
                msg.content = cleaned;
            }
        }

        self.draft.clear();
        self.run_status = RunStatus::Idle;
        self.turn_complete = true;
        self.current_activity = None;
    }

    /// Mark running unless end-of-run was already observed for this turn.
    pub fn mark_running(&mut self) {
        if !self.turn_complete {
            self.run_status = RunStatus::Running;
        }
    }

    /// Merge a denial list, deduplicating by tool + path.
    pub fn set_denials(&mut self, denials: Vec<PermissionDenial>) {
        let mut merged: Vec<PermissionDenial> = Vec::with_capacity(denials.len());
        for denial in denials {
            if !merged.iter().any(|d| d.key() == denial.key()) {
                merged.push(denial);
            }
        }
        self.permission_denials = merged;
    }

    /// Whether any content has accumulated for the current turn.
    #[must_use]
    pub fn has_draft(&self) -> bool {
        !self.draft.is_empty()
    }
}
