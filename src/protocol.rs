//! Line-delimited wire format spoken with the worker process.
//!
//! Every frame is one JSON object on one line. Inbound lines that are not
//! JSON objects are worker diagnostics and never protocol errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::permission::PermissionMode;

/// Correlation token assigned by the worker to a decision request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(i64),
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub media_type: String,
    /// Base64 payload, passed through untouched.
    pub data: String,
}

/// First line written to the worker for every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialCommand {
    pub message: String,
    pub session_id: Option<String>,
    pub cwd: String,
    pub permission_mode: PermissionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Payload of a correlated `response` frame, one shape per request kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    #[serde(rename_all = "camelCase")]
    Permission {
        allow: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Question {
        allow: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        answers: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Plan {
        approved: bool,
        new_mode: Option<PermissionMode>,
    },
}

impl Reply {
    /// Whether the reply lets the worker proceed.
    pub fn is_affirmative(&self) -> bool {
        match self {
            Self::Permission { allow, .. } | Self::Question { allow, .. } => *allow,
            Self::Plan { approved, .. } => *approved,
        }
    }
}

/// `{"type":"response","id":..., ...reply}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub id: CorrelationId,
    #[serde(flatten)]
    pub reply: Reply,
}

impl ResponseFrame {
    pub fn new(id: CorrelationId, reply: Reply) -> Self {
        Self {
            msg_type: "response",
            id,
            reply,
        }
    }
}

/// Events emitted by the worker on its standard output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        id: CorrelationId,
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
    },
    AskUserQuestion {
        id: CorrelationId,
        questions: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    PlanApproval {
        id: CorrelationId,
        #[serde(default)]
        plan: String,
        #[serde(default)]
        tool_input: Value,
    },
    #[serde(rename_all = "camelCase")]
    SessionId {
        session_id: String,
    },
    Content {
        text: String,
    },
    ContentDelta {
        delta: String,
    },
    Thinking {
        text: String,
    },
    ThinkingDelta {
        delta: String,
    },
    ToolUse {
        tool: Value,
    },
    ToolResult {
        result: Value,
    },
    Event {
        event: Value,
    },
    Done,
    Error {
        message: String,
    },
    /// Any `type` this host does not know, forwarded as-is.
    #[serde(skip)]
    Unrecognized(Value),
}

const KNOWN_TYPES: &[&str] = &[
    "permission_request",
    "ask_user_question",
    "plan_approval",
    "session_id",
    "content",
    "content_delta",
    "thinking",
    "thinking_delta",
    "tool_use",
    "tool_result",
    "event",
    "done",
    "error",
];

/// One decoded line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    Event(WorkerEvent),
    /// Log or diagnostic output, kept for troubleshooting only.
    Diagnostic(String),
}

/// Serialize a frame to a single line without the trailing newline.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let line = serde_json::to_string(frame)?;
    debug_assert!(!line.contains('\n'));
    Ok(line)
}

/// Decode one line of worker output.
///
/// Returns `None` for anything that is not a well-formed protocol frame:
/// blank lines, non-JSON output, JSON without a string `type`, or a known
/// type whose required fields are missing.
pub fn decode_line(line: &str) -> Option<WorkerEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let msg_type = value.get("type").and_then(Value::as_str)?.to_owned();

    if !KNOWN_TYPES.contains(&msg_type.as_str()) {
        return Some(WorkerEvent::Unrecognized(value));
    }

    match serde_json::from_value::<WorkerEvent>(value) {
        Ok(event) => Some(event),
        Err(error) => {
            tracing::warn!(
                target = "session_bridge::protocol",
                msg_type = %msg_type,
                error = %error,
                "dropping malformed worker frame"
            );
            None
        }
    }
}

/// Classify a raw output line as a protocol event or a diagnostic.
pub fn classify_line(line: &str) -> Option<InboundLine> {
    if line.trim().is_empty() {
        return None;
    }
    match decode_line(line) {
        Some(event) => Some(InboundLine::Event(event)),
        None => Some(InboundLine::Diagnostic(line.to_string())),
    }
}

impl WorkerEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::PermissionRequest { .. } => "permission_request",
            Self::AskUserQuestion { .. } => "ask_user_question",
            Self::PlanApproval { .. } => "plan_approval",
            Self::SessionId { .. } => "session_id",
            Self::Content { .. } => "content",
            Self::ContentDelta { .. } => "content_delta",
            Self::Thinking { .. } => "thinking",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Event { .. } => "event",
            Self::Done => "done",
            Self::Error { .. } => "error",
            Self::Unrecognized(value) => value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }
}

/// Question payloads arrive as arbitrary objects; hosts usually want the
/// prompt text for logging.
pub fn question_prompts(questions: &[Value]) -> Vec<String> {
    questions
        .iter()
        .filter_map(|question| match question {
            Value::String(text) => Some(text.clone()),
            Value::Object(map) => prompt_field(map),
            _ => None,
        })
        .collect()
}

fn prompt_field(map: &Map<String, Value>) -> Option<String> {
    ["question", "text", "header"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{
        classify_line, decode_line, encode_line, Attachment, CorrelationId, InboundLine,
        InitialCommand, Reply, ResponseFrame, WorkerEvent,
    };
    use crate::permission::PermissionMode;

    #[test]
    fn decodes_permission_request_with_numeric_id() {
        let line = r#"{"type":"permission_request","id":1,"toolName":"Delete","toolInput":{"file_path":"/p/temp.txt"}}"#;
        let event = decode_line(line).unwrap();
        assert_eq!(
            event,
            WorkerEvent::PermissionRequest {
                id: CorrelationId::Number(1),
                tool_name: "Delete".into(),
                tool_input: json!({"file_path": "/p/temp.txt"}),
            }
        );
    }

    #[test]
    fn decodes_string_correlation_ids() {
        let line = r#"{"type":"ask_user_question","id":"q-7","questions":[{"question":"Which db?"}]}"#;
        match decode_line(line).unwrap() {
            WorkerEvent::AskUserQuestion { id, questions } => {
                assert_eq!(id, CorrelationId::Text("q-7".into()));
                assert_eq!(questions.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decodes_streaming_events() {
        assert_eq!(
            decode_line(r#"{"type":"content_delta","delta":"Hel"}"#),
            Some(WorkerEvent::ContentDelta {
                delta: "Hel".into()
            })
        );
        assert_eq!(
            decode_line(r#"{"type":"session_id","sessionId":"abc"}"#),
            Some(WorkerEvent::SessionId {
                session_id: "abc".into()
            })
        );
        assert_eq!(decode_line(r#"{"type":"done"}"#), Some(WorkerEvent::Done));
    }

    #[test]
    fn non_json_lines_are_not_events() {
        assert_eq!(decode_line("[debug] loading config"), None);
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("{not json"), None);
        assert_eq!(decode_line(r#"{"no_type":true}"#), None);
        assert_eq!(
            classify_line("npm WARN deprecated"),
            Some(InboundLine::Diagnostic("npm WARN deprecated".into()))
        );
        assert_eq!(classify_line("   "), None);
    }

    #[test]
    fn known_type_missing_fields_is_dropped() {
        assert_eq!(decode_line(r#"{"type":"content_delta"}"#), None);
        assert_eq!(
            decode_line(r#"{"type":"permission_request","toolName":"Bash"}"#),
            None
        );
        // A valid frame right after a malformed one still decodes.
        assert_eq!(decode_line(r#"{"type":"done"}"#), Some(WorkerEvent::Done));
    }

    #[test]
    fn unknown_types_are_forwarded_opaquely() {
        let event = decode_line(r#"{"type":"usage","input_tokens":12}"#).unwrap();
        assert_eq!(event.kind(), "usage");
        match event {
            WorkerEvent::Unrecognized(value) => assert_eq!(value["input_tokens"], 12),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn permission_response_matches_wire_shape() {
        let frame = ResponseFrame::new(
            CorrelationId::Number(1),
            Reply::Permission {
                allow: true,
                message: None,
                updated_input: None,
            },
        );
        let value: Value = serde_json::from_str(&encode_line(&frame).unwrap()).unwrap();
        assert_eq!(value, json!({"type": "response", "id": 1, "allow": true}));
    }

    #[test]
    fn plan_response_carries_new_mode() {
        let frame = ResponseFrame::new(
            CorrelationId::Text("p1".into()),
            Reply::Plan {
                approved: true,
                new_mode: Some(PermissionMode::AcceptEdits),
            },
        );
        let value: Value = serde_json::from_str(&encode_line(&frame).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "response", "id": "p1", "approved": true, "newMode": "acceptEdits"})
        );
    }

    #[test]
    fn initial_command_omits_absent_optionals_and_stays_on_one_line() {
        let cmd = InitialCommand {
            message: "line one\nline two".into(),
            session_id: None,
            cwd: "/p".into(),
            permission_mode: PermissionMode::Default,
            model: None,
            opened_files: None,
            agent_prompt: None,
            streaming: Some(true),
            attachments: vec![Attachment {
                file_name: "a.png".into(),
                media_type: "image/png".into(),
                data: "AAAA".into(),
            }],
        };
        let line = encode_line(&cmd).unwrap();
        assert!(!line.contains('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["sessionId"], Value::Null);
        assert_eq!(value["permissionMode"], "default");
        assert_eq!(value["attachments"][0]["fileName"], "a.png");
        assert!(value.get("model").is_none());
    }
}
