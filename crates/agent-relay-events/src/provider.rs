//! Provider event model.
//!
//! Structured events arrive as JSON objects tagged by a `type` string.
//! The model is an open-ended variant set: new event types are added by
//! extending the enums and the match arms in `dispatch`; anything the
//! model does not know deserializes to `Unknown` and is ignored.

use serde::Deserialize;
use serde_json::Value;

/// Inner assistant-message event carried by a `message_update`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    /// Incremental assistant text.
    TextDelta { delta: String },
    /// Start of a thinking block.
    ThinkingStart,
    /// Incremental thinking text.
    ThinkingDelta { delta: String },
    /// End of a thinking block.
    ThinkingEnd,
    /// A tool began executing.
    ToolExecutionStart {
        #[serde(alias = "toolName")]
        tool_name: String,
        #[serde(default, alias = "path")]
        target: Option<String>,
    },
    /// A tool finished executing.
    ToolExecutionEnd {
        #[serde(alias = "toolName")]
        tool_name: String,
        #[serde(default, alias = "result")]
        output: Option<String>,
    },
    /// End of the assistant turn, optionally restating final text.
    TurnEnd {
        #[serde(default, alias = "content")]
        text: Option<String>,
    },
    /// Typed but unrecognized inner event.
    #[serde(other)]
    Unknown,
}

/// Top-level provider event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Assistant message progress.
    MessageUpdate {
        #[serde(rename = "assistantMessageEvent")]
        event: AssistantEvent,
    },
    /// The agent run ended at the provider level.
    ///
    /// Lifecycle-only: completion is driven by the transport's own
    /// end-of-stream signal, because a provider-level "done" can arrive
    /// before the transport is ready to close.
    AgentRunEnd,
    /// The agent asked a multi-choice question (top-level shape).
    AskUserQuestion {
        question: String,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default, alias = "toolUseId")]
        tool_use_id: Option<String>,
    },
    /// Typed but unrecognized event. Ignored, never rendered as text.
    #[serde(other)]
    Unknown,
}

/// A denied tool invocation as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DenialEntry {
    #[serde(alias = "toolName")]
    pub tool_name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Raw tool input; carries the question payload for the ask tool.
    #[serde(default)]
    pub input: Option<Value>,
}

/// A provider event together with any denial list riding on it.
///
/// `permission_denials` can accompany any event shape, so it is lifted
/// off the envelope before type dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub denials: Vec<DenialEntry>,
    pub event: ProviderEvent,
}

impl ParsedEvent {
    /// Extract the denial list and typed event from a JSON object.
    ///
    /// Returns `None` when the value is neither a recognized event nor a
    /// carrier of denials.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let denials: Vec<DenialEntry> = value
            .get("permission_denials")
            .or_else(|| value.get("permissionDenials"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let event = ProviderEvent::deserialize(value).unwrap_or(ProviderEvent::Unknown);

        if denials.is_empty() && event == ProviderEvent::Unknown {
            return None;
        }
        Some(Self { denials, event })
    }
}
