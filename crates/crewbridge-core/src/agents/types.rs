//! JSON shapes of the stream-json protocol.
//!
//! Records are only partially modelled: every field the decoder does not
//! need is ignored, and every field it does need is optional so that a
//! record with an unexpected shape degrades instead of failing.
//!
//! ```json
//! {"type":"system","subtype":"init","session_id":"sess-123"}
//! {"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}
//! {"type":"assistant","message":{"id":"msg_1","content":[{"type":"text","text":"Hello"}]}}
//! {"type":"control_request","request_id":"req-1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"}}}
//! {"type":"result","subtype":"success","is_error":false,"result":"Hello"}
//! ```

use serde::Deserialize;

/// Top-level record; `type` selects which optional fields are meaningful.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "type")]
    pub record_type: String,

    #[serde(default)]
    pub subtype: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    /// `system`/`status` records: "compacting" or null.
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub request_id: Option<String>,

    #[serde(default)]
    pub request: Option<ControlRequest>,

    #[serde(default)]
    pub message: Option<AssistantMessage>,

    /// Wrapped API event for `stream_event` records.
    #[serde(default)]
    pub event: Option<StreamInner>,

    /// Bare `content_block_delta` records.
    #[serde(default)]
    pub delta: Option<Delta>,

    #[serde(default)]
    pub result: Option<String>,

    #[serde(default)]
    pub is_error: bool,
}

/// A control request from the agent (tool permission).
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub subtype: String,

    #[serde(default)]
    pub tool_name: Option<String>,

    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// A content block (text, thinking, tool_use).
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamInner {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub delta: Option<Delta>,
}

/// Incremental text update.
#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    #[serde(rename = "type", default)]
    pub delta_type: String,

    #[serde(default)]
    pub text: Option<String>,
}

/// Input of the `TodoWrite` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct TodoWriteInput {
    #[serde(default)]
    pub todos: Vec<TodoItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub status: String,
}

/// Input of the `ExitPlanMode` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ExitPlanModeInput {
    #[serde(default)]
    pub plan: Option<String>,
}
