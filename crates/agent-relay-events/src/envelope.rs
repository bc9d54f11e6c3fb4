//! Event envelope classification.
//!
//! Each sanitized line is classified in priority order: session
//! lifecycle, stream end, typed provider event, reserved typed envelope,
//! and finally literal text.

use serde::Deserialize;
use serde_json::Value;

use crate::provider::ParsedEvent;

/// A session-lifecycle envelope: carries a new or alternate session id
/// and run metadata. Triggers a rekey and marks the run as running.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LifecycleEnvelope {
    #[serde(alias = "sessionId")]
    pub session_id: String,
    #[serde(default, alias = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default, alias = "allowedTools")]
    pub allowed_tools: Vec<String>,
}

/// Classified stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Session lifecycle: rekey target + run metadata.
    Lifecycle(LifecycleEnvelope),
    /// Graceful end of the stream, with an optional exit code.
    End { exit_code: Option<i32> },
    /// A structured provider event for the dispatcher.
    Provider(ParsedEvent),
    /// Reserved typed envelope: silently ignored, never rendered.
    Ignored,
    /// Literal assistant text (parse failure or untyped payload).
    Text(String),
}

/// Classify one sanitized line.
///
/// A line that fails JSON parsing is a literal text delta (with its
/// newline restored). Some transports prefix a stray marker before the
/// JSON body, so parsing is retried from the first `{` before giving up.
#[must_use]
pub fn parse_line(line: &str) -> Envelope {
    let Some(value) = parse_json_lenient(line) else {
        return Envelope::Text(format!("{line}\n"));
    };

    if !value.is_object() {
        return Envelope::Text(format!("{line}\n"));
    }

    let has_session_id =
        value.get("sessionId").is_some() || value.get("session_id").is_some();

    // An untyped envelope carrying a session id is a lifecycle envelope.
    // A recognized provider event keeps its meaning even when it happens
    // to tag a session id, so typed values fall through to dispatch first.
    if has_session_id && value.get("type").is_none() {
        if let Ok(lifecycle) = LifecycleEnvelope::deserialize(&value) {
            return Envelope::Lifecycle(lifecycle);
        }
    }

    if value.get("type").and_then(Value::as_str) == Some("stream_end") {
        let exit_code = value
            .get("exitCode")
            .or_else(|| value.get("exit_code"))
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok());
        return Envelope::End { exit_code };
    }

    if let Some(parsed) = ParsedEvent::from_value(&value) {
        return Envelope::Provider(parsed);
    }

    // Typed but unrecognized: a session id still means a rekey (lifecycle
    // envelopes may carry their own type tags).
    if has_session_id {
        if let Ok(lifecycle) = LifecycleEnvelope::deserialize(&value) {
            return Envelope::Lifecycle(lifecycle);
        }
    }

    if value.get("type").is_some() {
        tracing::debug!(line, "ignoring unrecognized typed envelope");
        return Envelope::Ignored;
    }

    Envelope::Text(format!("{line}\n"))
}

fn parse_json_lenient(line: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(line) {
        return Some(value);
    }
    // Stray marker before the JSON body: retry from the first brace.
    let brace = line.find('{')?;
    serde_json::from_str(&line[brace..]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AssistantEvent, ProviderEvent};

    #[test]
    fn non_json_line_becomes_text_delta_with_newline() {
        assert_eq!(
            parse_line("plain output"),
            Envelope::Text("plain output\n".to_string())
        );
    }

    #[test]
    fn lifecycle_envelope_may_carry_its_own_type_tag() {
        let env = parse_line(r#"{"sessionId":"s9","permissionMode":"default","type":"whatever"}"#);
        let Envelope::Lifecycle(lifecycle) = env else {
            panic!("expected lifecycle, got {env:?}");
        };
        assert_eq!(lifecycle.session_id, "s9");
        assert_eq!(lifecycle.permission_mode.as_deref(), Some("default"));
    }

    #[test]
    fn untyped_session_id_object_is_lifecycle() {
        let env = parse_line(r#"{"sessionId":"s9"}"#);
        assert!(matches!(env, Envelope::Lifecycle(l) if l.session_id == "s9"));
    }

    #[test]
    fn provider_event_with_session_id_is_not_swallowed_as_lifecycle() {
        let env = parse_line(
            r#"{"type":"message_update","sessionId":"s9","assistantMessageEvent":{"type":"text_delta","delta":"hi"}}"#,
        );
        assert!(matches!(env, Envelope::Provider(_)), "got {env:?}");
    }

    #[test]
    fn stream_end_carries_exit_code() {
        assert_eq!(
            parse_line(r#"{"type":"stream_end","exitCode":1}"#),
            Envelope::End { exit_code: Some(1) }
        );
        assert_eq!(
            parse_line(r#"{"type":"stream_end"}"#),
            Envelope::End { exit_code: None }
        );
    }

    #[test]
    fn provider_event_is_forwarded() {
        let env =
            parse_line(r#"{"type":"message_update","assistantMessageEvent":{"type":"text_delta","delta":"hi"}}"#);
        let Envelope::Provider(parsed) = env else {
            panic!("expected provider event, got {env:?}");
        };
        assert_eq!(
            parsed.event,
            ProviderEvent::MessageUpdate {
                event: AssistantEvent::TextDelta { delta: "hi".into() }
            }
        );
    }

    #[test]
    fn unknown_typed_envelope_is_ignored_not_rendered() {
        assert_eq!(parse_line(r#"{"type":"future_thing","v":2}"#), Envelope::Ignored);
    }

    #[test]
    fn untyped_object_falls_back_to_text() {
        assert_eq!(
            parse_line(r#"{"hello":"world"}"#),
            Envelope::Text("{\"hello\":\"world\"}\n".to_string())
        );
    }

    #[test]
    fn stray_marker_before_json_is_skipped() {
        let env = parse_line(r#"> {"type":"stream_end","exitCode":0}"#);
        assert_eq!(env, Envelope::End { exit_code: Some(0) });
    }

    #[test]
    fn stray_marker_without_valid_json_is_text() {
        assert_eq!(
            parse_line("> {broken"),
            Envelope::Text("> {broken\n".to_string())
        );
    }
}
