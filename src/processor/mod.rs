//! Upstream message normalization.
//!
//! The provider streams heterogeneous, loosely-shaped JSON messages. This
//! module turns any value — including null, non-objects, and unknown tags —
//! into the closed [`JobOutputEvent`] type without ever failing. Unknown
//! variants collapse to a `system` event rather than being dropped, so the
//! job log stays a faithful record of the stream.

use serde_json::Value;

use crate::job::{JobOutputEvent, TokenUsage};
use crate::session::UsageDelta;

/// Summary text is capped at this many characters.
const SUMMARY_MAX_CHARS: usize = 500;

/// A normalized upstream message.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub output: JobOutputEvent,
    /// Upstream session ID when the message exposes one.
    pub session_id: Option<String>,
    /// Token usage carried by this message, for conversation accumulation.
    pub usage: Option<UsageDelta>,
    /// Whether the stream ends after this message.
    pub is_terminal: bool,
}

/// Normalize one upstream message. Never panics, never errors.
pub fn process(message: &Value) -> ProcessedEvent {
    let Some(obj) = message.as_object() else {
        return unknown_event(message);
    };
    let tag = obj.get("type").and_then(Value::as_str).unwrap_or("");

    match tag {
        "system" => {
            let subtype = obj.get("subtype").and_then(Value::as_str).map(String::from);
            let session_id = if subtype.as_deref() == Some("init") {
                obj.get("session_id").and_then(Value::as_str).map(String::from)
            } else {
                None
            };
            ProcessedEvent {
                output: JobOutputEvent::System {
                    subtype: subtype.clone(),
                    content: text_of(obj.get("content")),
                },
                session_id,
                usage: None,
                is_terminal: matches!(
                    subtype.as_deref(),
                    Some("end") | Some("complete") | Some("session_end")
                ),
            }
        }
        "assistant" => {
            let content = assistant_text(message);
            let usage = extract_usage(message);
            ProcessedEvent {
                output: JobOutputEvent::Assistant {
                    content,
                    partial: false,
                    usage: usage.map(to_token_usage),
                },
                session_id: obj.get("session_id").and_then(Value::as_str).map(String::from),
                usage,
                is_terminal: false,
            }
        }
        "stream_event" => {
            let delta = message
                .pointer("/event/delta/text")
                .or_else(|| message.pointer("/delta/text"))
                .and_then(Value::as_str)
                .map(String::from);
            ProcessedEvent {
                output: JobOutputEvent::Assistant {
                    content: delta,
                    partial: true,
                    usage: None,
                },
                session_id: None,
                usage: None,
                is_terminal: false,
            }
        }
        "result" => {
            let usage = extract_usage(message);
            ProcessedEvent {
                output: JobOutputEvent::Assistant {
                    content: obj.get("result").and_then(Value::as_str).map(String::from),
                    partial: false,
                    usage: usage.map(to_token_usage),
                },
                session_id: obj.get("session_id").and_then(Value::as_str).map(String::from),
                usage,
                is_terminal: true,
            }
        }
        "user" => match tool_result_of(message) {
            Some(event) => ProcessedEvent {
                output: event,
                session_id: None,
                usage: None,
                is_terminal: false,
            },
            None => ProcessedEvent {
                output: JobOutputEvent::System {
                    subtype: Some("user_input".to_string()),
                    content: assistant_text(message),
                },
                session_id: None,
                usage: None,
                is_terminal: false,
            },
        },
        "tool_progress" => ProcessedEvent {
            output: JobOutputEvent::System {
                subtype: Some("tool_progress".to_string()),
                content: Some(format!(
                    "{} {}",
                    obj.get("tool_name").and_then(Value::as_str).unwrap_or("tool"),
                    obj.get("status").and_then(Value::as_str).unwrap_or("running")
                )),
            },
            session_id: None,
            usage: None,
            is_terminal: false,
        },
        "auth_status" => ProcessedEvent {
            output: JobOutputEvent::System {
                subtype: Some("auth_status".to_string()),
                content: text_of(obj.get("status")).or_else(|| text_of(obj.get("message"))),
            },
            session_id: None,
            usage: None,
            is_terminal: false,
        },
        "error" => ProcessedEvent {
            output: JobOutputEvent::Error {
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown upstream error")
                    .to_string(),
                code: text_of(obj.get("code")),
                stack: obj.get("stack").and_then(Value::as_str).map(String::from),
            },
            session_id: None,
            usage: None,
            is_terminal: true,
        },
        "tool_use" => ProcessedEvent {
            output: JobOutputEvent::ToolUse {
                tool_name: obj
                    .get("tool_name")
                    .or_else(|| obj.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                tool_use_id: obj.get("tool_use_id").and_then(Value::as_str).map(String::from),
                input: obj.get("input").cloned(),
            },
            session_id: None,
            usage: None,
            is_terminal: false,
        },
        "tool_result" => ProcessedEvent {
            output: JobOutputEvent::ToolResult {
                tool_use_id: obj.get("tool_use_id").and_then(Value::as_str).map(String::from),
                result: text_of(obj.get("result")).or_else(|| text_of(obj.get("content"))),
                success: obj.get("success").and_then(Value::as_bool),
                error: obj.get("error").and_then(Value::as_str).map(String::from),
            },
            session_id: None,
            usage: None,
            is_terminal: false,
        },
        _ => unknown_event(message),
    }
}

/// Whether the stream ends after this message.
pub fn is_terminal(message: &Value) -> bool {
    process(message).is_terminal
}

fn unknown_event(message: &Value) -> ProcessedEvent {
    let mut content = message.to_string();
    if content.chars().count() > 2000 {
        content = content.chars().take(2000).collect();
    }
    ProcessedEvent {
        output: JobOutputEvent::System {
            subtype: Some("unknown_type".to_string()),
            content: Some(content),
        },
        session_id: None,
        usage: None,
        is_terminal: false,
    }
}

/// Extract assistant-visible text: a plain string, or the concatenation of
/// `text` blocks in a structured content array. Non-text blocks are skipped.
fn assistant_text(message: &Value) -> Option<String> {
    let content = message
        .pointer("/message/content")
        .or_else(|| message.get("content"))?;

    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(""))
            }
        }
        _ => None,
    }
}

/// Usage may appear at the outer level or nested under `message`.
fn extract_usage(message: &Value) -> Option<UsageDelta> {
    let usage = message
        .get("usage")
        .or_else(|| message.pointer("/message/usage"))?;
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(UsageDelta {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
        context_window: usage.get("context_window").and_then(Value::as_u64),
    })
}

fn to_token_usage(delta: UsageDelta) -> TokenUsage {
    TokenUsage {
        input_tokens: delta.input_tokens,
        output_tokens: delta.output_tokens,
        context_window: delta.context_window,
    }
}

fn tool_result_of(message: &Value) -> Option<JobOutputEvent> {
    let blocks = message.pointer("/message/content")?.as_array()?;
    let block = blocks
        .iter()
        .find(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))?;
    let is_error = block.get("is_error").and_then(Value::as_bool);
    Some(JobOutputEvent::ToolResult {
        tool_use_id: block.get("tool_use_id").and_then(Value::as_str).map(String::from),
        result: text_of(block.get("content")),
        success: is_error.map(|e| !e),
        error: None,
    })
}

/// String form of a scalar-or-structured value.
fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Explicit summary > result text > last non-partial assistant content,
/// truncated to 500 characters with an ellipsis.
pub fn extract_summary(terminal: Option<&Value>, last_assistant: Option<&str>) -> Option<String> {
    let explicit = terminal.and_then(|msg| {
        msg.get("summary")
            .and_then(Value::as_str)
            .or_else(|| msg.get("result").and_then(Value::as_str))
            .map(String::from)
    });
    explicit
        .or_else(|| last_assistant.map(String::from))
        .map(|s| truncate_summary(&s))
}

fn truncate_summary(s: &str) -> String {
    if s.chars().count() <= SUMMARY_MAX_CHARS {
        return s.to_string();
    }
    let truncated: String = s.chars().take(SUMMARY_MAX_CHARS).collect();
    format!("{}…", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_and_non_object_are_unknown() {
        for value in [json!(null), json!(42), json!("text"), json!([1, 2])] {
            let event = process(&value);
            match event.output {
                JobOutputEvent::System { subtype, .. } => {
                    assert_eq!(subtype.as_deref(), Some("unknown_type"));
                }
                other => panic!("unexpected: {:?}", other),
            }
            assert!(!event.is_terminal);
        }
    }

    #[test]
    fn test_unknown_multibyte_payload_truncates_on_char_boundary() {
        // Stringified form puts a multi-byte char across the cut point.
        let event = process(&json!({"type": "telemetry", "payload": "é".repeat(3000)}));
        match event.output {
            JobOutputEvent::System { subtype, content } => {
                assert_eq!(subtype.as_deref(), Some("unknown_type"));
                assert!(content.unwrap().chars().count() <= 2000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_collapses() {
        let event = process(&json!({"type": "telemetry", "payload": {}}));
        match event.output {
            JobOutputEvent::System { subtype, content } => {
                assert_eq!(subtype.as_deref(), Some("unknown_type"));
                assert!(content.unwrap().contains("telemetry"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_system_init_exposes_session_id() {
        let event = process(&json!({
            "type": "system", "subtype": "init", "session_id": "S1"
        }));
        assert_eq!(event.session_id.as_deref(), Some("S1"));
        assert!(!event.is_terminal);

        // Session ID is only trusted on init.
        let event = process(&json!({
            "type": "system", "subtype": "status", "session_id": "S1"
        }));
        assert!(event.session_id.is_none());
    }

    #[test]
    fn test_system_terminal_subtypes() {
        for subtype in ["end", "complete", "session_end"] {
            assert!(is_terminal(&json!({"type": "system", "subtype": subtype})));
        }
        assert!(!is_terminal(&json!({"type": "system", "subtype": "init"})));
    }

    #[test]
    fn test_assistant_string_content() {
        let event = process(&json!({
            "type": "assistant",
            "message": {"content": "hello"}
        }));
        match event.output {
            JobOutputEvent::Assistant {
                content, partial, ..
            } => {
                assert_eq!(content.as_deref(), Some("hello"));
                assert!(!partial);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_assistant_block_content_skips_non_text() {
        let event = process(&json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "part one "},
                {"type": "tool_use", "name": "Read"},
                {"type": "text", "text": "part two"}
            ]}
        }));
        match event.output {
            JobOutputEvent::Assistant { content, .. } => {
                assert_eq!(content.as_deref(), Some("part one part two"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_usage_nested_or_outer() {
        let outer = process(&json!({
            "type": "assistant",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }));
        let nested = process(&json!({
            "type": "assistant",
            "message": {"usage": {"input_tokens": 10, "output_tokens": 5}}
        }));
        for event in [outer, nested] {
            let usage = event.usage.unwrap();
            assert_eq!(usage.input_tokens, 10);
            assert_eq!(usage.output_tokens, 5);
        }
    }

    #[test]
    fn test_stream_event_is_partial() {
        let event = process(&json!({
            "type": "stream_event",
            "event": {"delta": {"text": "chun"}}
        }));
        match event.output {
            JobOutputEvent::Assistant {
                content, partial, ..
            } => {
                assert_eq!(content.as_deref(), Some("chun"));
                assert!(partial);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_result_is_terminal_with_usage() {
        let event = process(&json!({
            "type": "result",
            "result": "all done",
            "session_id": "S9",
            "usage": {"input_tokens": 100, "output_tokens": 20, "context_window": 200000}
        }));
        assert!(event.is_terminal);
        assert_eq!(event.session_id.as_deref(), Some("S9"));
        assert_eq!(event.usage.unwrap().context_window, Some(200_000));
    }

    #[test]
    fn test_user_tool_result() {
        let event = process(&json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok", "is_error": false}
            ]}
        }));
        match event.output {
            JobOutputEvent::ToolResult {
                tool_use_id,
                result,
                success,
                ..
            } => {
                assert_eq!(tool_use_id.as_deref(), Some("t1"));
                assert_eq!(result.as_deref(), Some("ok"));
                assert_eq!(success, Some(true));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_user_without_tool_result() {
        let event = process(&json!({
            "type": "user",
            "message": {"content": "typed something"}
        }));
        match event.output {
            JobOutputEvent::System { subtype, .. } => {
                assert_eq!(subtype.as_deref(), Some("user_input"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_error_is_terminal() {
        let event = process(&json!({
            "type": "error", "message": "boom", "code": "E1"
        }));
        assert!(event.is_terminal);
        match event.output {
            JobOutputEvent::Error { message, code, .. } => {
                assert_eq!(message, "boom");
                assert_eq!(code.as_deref(), Some("E1"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_legacy_flat_tool_events() {
        let event = process(&json!({
            "type": "tool_use", "tool_name": "Bash", "input": {"command": "ls"}
        }));
        assert!(matches!(event.output, JobOutputEvent::ToolUse { .. }));

        let event = process(&json!({
            "type": "tool_result", "tool_use_id": "t2", "result": "done", "success": true
        }));
        assert!(matches!(event.output, JobOutputEvent::ToolResult { .. }));
    }

    #[test]
    fn test_summary_preference_chain() {
        let terminal = json!({"type": "result", "summary": "explicit", "result": "result text"});
        assert_eq!(
            extract_summary(Some(&terminal), Some("assistant text")).as_deref(),
            Some("explicit")
        );

        let terminal = json!({"type": "result", "result": "result text"});
        assert_eq!(
            extract_summary(Some(&terminal), Some("assistant text")).as_deref(),
            Some("result text")
        );

        assert_eq!(
            extract_summary(None, Some("assistant text")).as_deref(),
            Some("assistant text")
        );
        assert!(extract_summary(None, None).is_none());
    }

    #[test]
    fn test_summary_truncation() {
        let long = "x".repeat(600);
        let summary = extract_summary(None, Some(&long)).unwrap();
        assert_eq!(summary.chars().count(), 501);
        assert!(summary.ends_with('…'));
    }
}
