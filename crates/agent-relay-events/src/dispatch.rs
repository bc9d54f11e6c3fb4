//! Provider event dispatch.
//!
//! Pure side-effecting over session state via an injected context, so the
//! same dispatch logic drives the live connection and the tests.

use agent_relay_core::{PendingQuestion, PermissionDenial, SessionId, ToolActivity};
use serde_json::Value;

use crate::provider::{AssistantEvent, DenialEntry, ParsedEvent, ProviderEvent};

/// Name of the multi-choice question tool. A denial naming this tool is a
/// question waiting for an answer, not a denial.
const ASK_TOOL: &str = "ask_user_question";

/// Effects a dispatched event may have on session state.
///
/// Implemented over the session store by the connection layer; tests use
/// a recording fake.
pub trait SessionEffects {
    /// Append streamed assistant text to the draft.
    fn append_delta(&mut self, text: &str);
    /// Mark the session running (unless the turn already completed).
    fn set_running(&mut self);
    /// Record the currently executing tool.
    fn set_activity(&mut self, activity: Option<ToolActivity>);
    /// Consume the recorded tool activity.
    fn take_activity(&mut self) -> Option<ToolActivity>;
    /// Replace the session's denial list.
    fn set_denials(&mut self, denials: Vec<PermissionDenial>);
    /// Set the pending question and mark the session waiting for input.
    fn set_pending_question(&mut self, question: PendingQuestion);
    /// Move the session to a server-assigned id.
    fn rekey(&mut self, new_id: SessionId);
    /// The draft accumulated so far (for final-text deduplication).
    fn draft(&self) -> String;
}

/// Apply one parsed provider event to session state.
///
/// Denials are handled before generic type lookup; unknown typed events
/// cause no mutation.
pub fn dispatch(parsed: ParsedEvent, fx: &mut dyn SessionEffects) {
    if !parsed.denials.is_empty() {
        apply_denials(parsed.denials, fx);
    }

    match parsed.event {
        ProviderEvent::MessageUpdate { event } => dispatch_assistant(event, fx),
        ProviderEvent::AskUserQuestion {
            question,
            options,
            tool_use_id,
        } => {
            fx.set_pending_question(PendingQuestion {
                question,
                options,
                tool_use_id,
            });
        }
        ProviderEvent::AgentRunEnd => {
            // Lifecycle-only. Completion is driven by the transport's
            // end-of-stream signal, which may lag this event.
            tracing::debug!("agent_run_end observed; awaiting transport close");
        }
        ProviderEvent::Unknown => {}
    }
}

fn dispatch_assistant(event: AssistantEvent, fx: &mut dyn SessionEffects) {
    match event {
        AssistantEvent::TextDelta { delta } => {
            fx.append_delta(&delta);
            fx.set_running();
        }
        AssistantEvent::ThinkingStart => fx.append_delta("\n[thinking]\n"),
        AssistantEvent::ThinkingDelta { delta } => fx.append_delta(&delta),
        AssistantEvent::ThinkingEnd => fx.append_delta("\n[/thinking]\n"),
        AssistantEvent::ToolExecutionStart { tool_name, target } => {
            fx.set_activity(Some(ToolActivity { tool_name, target }));
        }
        AssistantEvent::ToolExecutionEnd { tool_name, output } => {
            let activity = fx.take_activity();
            let trace = render_tool_trace(&tool_name, activity.as_ref(), output.as_deref());
            fx.append_delta(&trace);
        }
        AssistantEvent::TurnEnd { text } => {
            if let Some(text) = text {
                append_final_text(&text, fx);
            }
        }
        AssistantEvent::Unknown => {}
    }
}

/// One-shot final text from `turn_end`, deduplicated against what already
/// streamed. Best-effort suffix heuristic: a final summary that restates
/// the streamed text is skipped, partial overlaps are not detected.
fn append_final_text(text: &str, fx: &mut dyn SessionEffects) {
    let draft = fx.draft();
    if draft.trim_end().ends_with(text.trim_end()) {
        return;
    }
    fx.append_delta(text);
}

fn apply_denials(entries: Vec<DenialEntry>, fx: &mut dyn SessionEffects) {
    let mut denials = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.tool_name.eq_ignore_ascii_case(ASK_TOOL) {
            // The ask tool is a question, not a denial.
            fx.set_pending_question(question_from_denial(&entry));
            continue;
        }
        denials.push(PermissionDenial {
            tool_name: entry.tool_name,
            path: entry.path,
            message: entry.message,
        });
    }
    if !denials.is_empty() {
        fx.set_denials(denials);
    }
}

fn question_from_denial(entry: &DenialEntry) -> PendingQuestion {
    let input = entry.input.as_ref();
    let question = input
        .and_then(|v| v.get("question"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| entry.message.clone())
        .unwrap_or_default();
    let options = input
        .and_then(|v| v.get("options"))
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    o.as_str()
                        .map(str::to_string)
                        .or_else(|| o.get("label").and_then(Value::as_str).map(str::to_string))
                })
                .collect()
        })
        .unwrap_or_default();
    let tool_use_id = input
        .and_then(|v| v.get("tool_use_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    PendingQuestion {
        question,
        options,
        tool_use_id,
    }
}

/// Render a compact human-readable trace of a finished tool.
///
/// File-read tools are summarized, never echoed; shell-like tools show
/// their output fenced; everything else gets a one-line note.
fn render_tool_trace(tool_name: &str, activity: Option<&ToolActivity>, output: Option<&str>) -> String {
    let target = activity.and_then(|a| a.target.as_deref());
    let lower = tool_name.to_ascii_lowercase();

    if lower.contains("read") {
        let lines = output.map_or(0, |o| o.lines().count());
        return match target {
            Some(path) => format!("\n[read {path} ({lines} lines)]\n"),
            None => format!("\n[{tool_name}: {lines} lines]\n"),
        };
    }

    if is_shell_like(&lower) {
        let body = output.unwrap_or("").trim_end();
        return match target {
            Some(cmd) => format!("\n$ {cmd}\n```\n{body}\n```\n"),
            None => format!("\n```\n{body}\n```\n"),
        };
    }

    match (target, output) {
        (Some(t), _) => format!("\n[{tool_name} {t}]\n"),
        (None, Some(o)) if !o.trim().is_empty() => {
            let first = o.lines().next().unwrap_or("");
            format!("\n[{tool_name}: {first}]\n")
        }
        _ => format!("\n[{tool_name} done]\n"),
    }
}

fn is_shell_like(tool: &str) -> bool {
    ["bash", "shell", "exec", "command", "run"]
        .iter()
        .any(|s| tool.contains(s))
}
