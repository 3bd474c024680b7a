//! Typed events decoded from an agent's output stream.

use serde::{Deserialize, Serialize};

use crate::session::{AgentState, TaskItem};

/// Event decoded from one stream-json record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AgentEvent {
    /// The process reported it is ready, with its conversation id if any.
    Ready {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// A chunk of streaming reply text.
    TextDelta { text: String },

    /// A complete reply message.
    MessageComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        text: String,
    },

    /// The agent needs approval to run a tool.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    /// The agent wants its plan approved before acting.
    PlanRequest { request_id: String, plan: String },

    /// The agent replaced its task list.
    TaskUpdate { tasks: Vec<TaskItem> },

    /// The agent moved to a new running state.
    StateChange { state: AgentState },

    /// The agent reported an error of its own.
    ProcessError { message: String },

    /// A record could not be decoded.
    ProtocolError { raw: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TaskStatus;

    #[test]
    fn uses_camel_case_tag() {
        let json = serde_json::to_string(&AgentEvent::TextDelta {
            text: "hi".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"textDelta\""));
    }

    #[test]
    fn ready_skips_missing_session() {
        let json = serde_json::to_string(&AgentEvent::Ready { session_id: None }).unwrap();
        assert_eq!(json, r#"{"kind":"ready"}"#);
    }

    #[test]
    fn task_update_roundtrip() {
        let event = AgentEvent::TaskUpdate {
            tasks: vec![TaskItem {
                id: "1".to_string(),
                description: "Write tests".to_string(),
                status: TaskStatus::InProgress,
            }],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("in_progress"));
        let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
