//! Stream-json decoder.
//!
//! Turns the raw bytes an agent writes to stdout into [`AgentEvent`]s:
//! 1. Bytes are buffered until a newline completes a record
//! 2. Each record is parsed as JSON and dispatched on its `type`
//! 3. The record is translated into zero or more events
//!
//! A line that is not valid UTF-8, not JSON, or not a typed object becomes a
//! [`AgentEvent::ProtocolError`] carrying the raw line; decoding carries on
//! with the next line. Records of unknown type are skipped.

use serde_json::Value;

use crate::agents::event::AgentEvent;
use crate::session::{AgentState, TaskItem, TaskStatus};

use super::types::{ExitPlanModeInput, StreamRecord, TodoWriteInput};

/// Tool whose permission request is a plan approval.
const PLAN_TOOL: &str = "ExitPlanMode";

/// Tool whose invocation replaces the agent's task list.
const TASK_TOOL: &str = "TodoWrite";

/// Record types that carry nothing for observers.
const IGNORED_TYPES: &[&str] = &["user", "control_response", "control_cancel_request", "keep_alive"];

/// Incremental decoder for one process's stdout.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Bytes after the last newline seen so far.
    buffer: Vec<u8>,
    /// Conversation id reported by the agent.
    session_id: Option<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversation id reported by the agent's init record, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Feed a chunk of output and collect the events of every completed line.
    ///
    /// Chunks may split records (and UTF-8 sequences) anywhere; the
    /// incomplete tail is kept for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.feed_with(chunk, |_| {})
    }

    /// Like [`feed`](Self::feed), also handing each completed, non-empty
    /// line to `inspect` before it is decoded.
    pub fn feed_with(&mut self, chunk: &[u8], inspect: impl FnMut(&[u8])) -> Vec<AgentEvent> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let tail = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);
        self.decode_lines(&complete, inspect)
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        self.finish_with(|_| {})
    }

    pub fn finish_with(&mut self, inspect: impl FnMut(&[u8])) -> Vec<AgentEvent> {
        let remaining = std::mem::take(&mut self.buffer);
        self.decode_lines(&remaining, inspect)
    }

    fn decode_lines(&mut self, bytes: &[u8], mut inspect: impl FnMut(&[u8])) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for line in bytes.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            inspect(line);
            events.extend(self.decode_line(line));
        }
        events
    }

    fn decode_line(&mut self, line: &[u8]) -> Vec<AgentEvent> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(e) => {
                return vec![protocol_error(
                    String::from_utf8_lossy(line).trim(),
                    format!("invalid UTF-8: {e}"),
                )]
            }
        };
        if text.is_empty() {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return vec![protocol_error(text, e.to_string())],
        };

        let Some(record_type) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return vec![protocol_error(text, "record has no string \"type\" field")];
        };

        match record_type.as_str() {
            "error" => vec![AgentEvent::ProcessError {
                message: error_message(&value),
            }],
            "system" | "stream_event" | "content_block_delta" | "assistant" | "result"
            | "control_request" => match serde_json::from_value::<StreamRecord>(value) {
                Ok(record) => self.translate(&record, text),
                Err(e) => vec![protocol_error(text, e.to_string())],
            },
            t if IGNORED_TYPES.contains(&t) => Vec::new(),
            other => {
                log::debug!("Skipping stream record of unknown type '{}'", other);
                Vec::new()
            }
        }
    }

    fn translate(&mut self, record: &StreamRecord, raw: &str) -> Vec<AgentEvent> {
        match record.record_type.as_str() {
            "system" => self.translate_system(record),

            "stream_event" => record
                .event
                .as_ref()
                .filter(|inner| inner.event_type == "content_block_delta")
                .and_then(|inner| text_delta(inner.delta.as_ref()))
                .into_iter()
                .collect(),

            "content_block_delta" => text_delta(record.delta.as_ref()).into_iter().collect(),

            "assistant" => translate_assistant(record),

            "result" => {
                let mut events = Vec::new();
                if record.is_error {
                    events.push(AgentEvent::ProcessError {
                        message: record
                            .result
                            .clone()
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "Agent reported an error".to_string()),
                    });
                }
                events.push(AgentEvent::StateChange {
                    state: AgentState::Idle,
                });
                events
            }

            "control_request" => translate_control_request(record, raw),

            _ => Vec::new(),
        }
    }

    fn translate_system(&mut self, record: &StreamRecord) -> Vec<AgentEvent> {
        match record.subtype.as_deref() {
            Some("init") => {
                if record.session_id.is_some() {
                    self.session_id = record.session_id.clone();
                }
                vec![AgentEvent::Ready {
                    session_id: record.session_id.clone(),
                }]
            }
            Some("status") if record.status.as_deref() == Some("compacting") => {
                vec![AgentEvent::StateChange {
                    state: AgentState::Compacting,
                }]
            }
            Some("compact_boundary") => vec![AgentEvent::StateChange {
                state: AgentState::Idle,
            }],
            _ => Vec::new(),
        }
    }
}

fn text_delta(delta: Option<&super::types::Delta>) -> Option<AgentEvent> {
    let delta = delta?;
    if delta.delta_type != "text_delta" {
        return None;
    }
    delta
        .text
        .as_ref()
        .filter(|t| !t.is_empty())
        .map(|text| AgentEvent::TextDelta { text: text.clone() })
}

fn translate_assistant(record: &StreamRecord) -> Vec<AgentEvent> {
    let Some(message) = record.message.as_ref() else {
        return Vec::new();
    };

    let mut texts = Vec::new();
    let mut task_updates = Vec::new();
    for block in &message.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(text) = block.text.as_deref().map(str::trim) {
                    if !text.is_empty() {
                        texts.push(text);
                    }
                }
            }
            "tool_use" if block.name.as_deref() == Some(TASK_TOOL) => {
                if let Some(tasks) = block.input.as_ref().and_then(parse_tasks) {
                    task_updates.push(AgentEvent::TaskUpdate { tasks });
                }
            }
            _ => {}
        }
    }

    let mut events = Vec::with_capacity(task_updates.len() + 1);
    if !texts.is_empty() {
        events.push(AgentEvent::MessageComplete {
            id: message.id.clone(),
            text: texts.join("\n\n"),
        });
    }
    events.extend(task_updates);
    events
}

fn translate_control_request(record: &StreamRecord, raw: &str) -> Vec<AgentEvent> {
    let Some(request_id) = record.request_id.clone().filter(|id| !id.is_empty()) else {
        return vec![protocol_error(raw, "control_request without request_id")];
    };
    let Some(request) = record.request.as_ref() else {
        return vec![protocol_error(raw, "control_request without request")];
    };
    if request.subtype != "can_use_tool" {
        log::debug!("Skipping control_request subtype '{}'", request.subtype);
        return Vec::new();
    }

    let tool_name = request.tool_name.clone().unwrap_or_default();
    let input = request
        .input
        .clone()
        .unwrap_or_else(|| Value::Object(Default::default()));

    if tool_name == PLAN_TOOL {
        let plan = serde_json::from_value::<ExitPlanModeInput>(input)
            .ok()
            .and_then(|p| p.plan)
            .unwrap_or_default();
        return vec![AgentEvent::PlanRequest { request_id, plan }];
    }

    vec![AgentEvent::PermissionRequest {
        request_id,
        tool_name,
        input,
    }]
}

/// Tasks from a `TodoWrite` input; items without an id are numbered from 1.
fn parse_tasks(input: &Value) -> Option<Vec<TaskItem>> {
    let parsed = serde_json::from_value::<TodoWriteInput>(input.clone()).ok()?;
    Some(
        parsed
            .todos
            .into_iter()
            .enumerate()
            .map(|(index, todo)| TaskItem {
                id: todo.id.unwrap_or_else(|| (index + 1).to_string()),
                description: todo.content,
                status: TaskStatus::parse(&todo.status),
            })
            .collect(),
    )
}

fn error_message(value: &Value) -> String {
    let field = value.get("message").or_else(|| value.get("error"));
    match field {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "Unknown agent error".to_string(),
    }
}

fn protocol_error(raw: &str, error: impl Into<String>) -> AgentEvent {
    AgentEvent::ProtocolError {
        raw: raw.to_string(),
        error: error.into(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(lines: &[&str]) -> Vec<AgentEvent> {
        let mut decoder = StreamDecoder::new();
        let mut input = lines.join("\n");
        input.push('\n');
        decoder.feed(input.as_bytes())
    }

    mod buffering {
        use super::*;

        #[test]
        fn partial_lines_wait_for_newline() {
            let mut decoder = StreamDecoder::new();
            let line = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#;
            let (head, tail) = line.split_at(20);

            assert!(decoder.feed(head.as_bytes()).is_empty());
            assert!(decoder.feed(tail.as_bytes()).is_empty());
            let events = decoder.feed(b"\n");
            assert_eq!(
                events,
                vec![AgentEvent::TextDelta {
                    text: "Hi".to_string()
                }]
            );
        }

        #[test]
        fn multiple_lines_in_one_chunk() {
            let events = decode(&[
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"a"}}"#,
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"b"}}"#,
            ]);
            assert_eq!(events.len(), 2);
        }

        #[test]
        fn split_utf8_sequence_is_reassembled() {
            let mut decoder = StreamDecoder::new();
            let line = "{\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"héllo\"}}\n";
            let bytes = line.as_bytes();
            let split = line.find('é').unwrap() + 1; // inside the two-byte sequence

            assert!(decoder.feed(&bytes[..split]).is_empty());
            let events = decoder.feed(&bytes[split..]);
            assert_eq!(
                events,
                vec![AgentEvent::TextDelta {
                    text: "héllo".to_string()
                }]
            );
        }

        #[test]
        fn finish_flushes_unterminated_record() {
            let mut decoder = StreamDecoder::new();
            assert!(decoder
                .feed(br#"{"type":"result","subtype":"success"}"#)
                .is_empty());
            let events = decoder.finish();
            assert_eq!(
                events,
                vec![AgentEvent::StateChange {
                    state: AgentState::Idle
                }]
            );
            assert!(decoder.finish().is_empty());
        }

        #[test]
        fn feed_with_sees_each_line() {
            let mut decoder = StreamDecoder::new();
            let mut seen = Vec::new();
            decoder.feed_with(b"{\"type\":\"result\"}\r\n\nnot json\n{\"type\"", |line| {
                seen.push(String::from_utf8_lossy(line).into_owned())
            });
            assert_eq!(seen, vec!["{\"type\":\"result\"}", "not json"]);

            decoder.feed_with(b":\"result\"}", |_| panic!("line is incomplete"));
            let mut rest = Vec::new();
            let events = decoder.finish_with(|line| rest.push(line.to_vec()));
            assert_eq!(rest, vec![b"{\"type\":\"result\"}".to_vec()]);
            assert_eq!(events.len(), 1);
        }

        #[test]
        fn blank_and_crlf_lines() {
            let mut decoder = StreamDecoder::new();
            let events = decoder.feed(b"\r\n   \n{\"type\":\"result\"}\r\n");
            assert_eq!(events.len(), 1);
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn malformed_line_does_not_stop_decoding() {
            let events = decode(&[
                "this is not json",
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"ok"}}"#,
            ]);

            assert_eq!(events.len(), 2);
            match &events[0] {
                AgentEvent::ProtocolError { raw, .. } => assert_eq!(raw, "this is not json"),
                other => panic!("Expected ProtocolError, got {:?}", other),
            }
            assert!(matches!(&events[1], AgentEvent::TextDelta { text } if text == "ok"));
        }

        #[test]
        fn missing_type_is_protocol_error() {
            let events = decode(&[r#"{"hello":"world"}"#, "[1,2,3]"]);
            assert_eq!(events.len(), 2);
            assert!(events
                .iter()
                .all(|e| matches!(e, AgentEvent::ProtocolError { .. })));
        }

        #[test]
        fn invalid_utf8_is_protocol_error() {
            let mut decoder = StreamDecoder::new();
            let events = decoder.feed(b"\xff\xfe\n");
            assert!(matches!(&events[0], AgentEvent::ProtocolError { error, .. } if error.contains("UTF-8")));
        }

        #[test]
        fn wrongly_shaped_known_record_is_protocol_error() {
            let events = decode(&[r#"{"type":"assistant","message":"just a string"}"#]);
            assert!(matches!(&events[0], AgentEvent::ProtocolError { .. }));
        }

        #[test]
        fn error_record_is_process_error() {
            let events = decode(&[
                r#"{"type":"error","message":"rate limited"}"#,
                r#"{"type":"error","error":{"type":"overloaded","message":"busy"}}"#,
            ]);
            assert_eq!(
                events,
                vec![
                    AgentEvent::ProcessError {
                        message: "rate limited".to_string()
                    },
                    AgentEvent::ProcessError {
                        message: "busy".to_string()
                    },
                ]
            );
        }

        #[test]
        fn unknown_types_are_skipped() {
            let events = decode(&[
                r#"{"type":"user","message":{"role":"user","content":"echo"}}"#,
                r#"{"type":"brand_new_thing","x":1}"#,
            ]);
            assert!(events.is_empty());
        }
    }

    mod records {
        use super::*;

        #[test]
        fn init_reports_ready_and_session() {
            let mut decoder = StreamDecoder::new();
            let events = decoder.feed(
                b"{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess-1\",\"tools\":[]}\n",
            );
            assert_eq!(
                events,
                vec![AgentEvent::Ready {
                    session_id: Some("sess-1".to_string())
                }]
            );
            assert_eq!(decoder.session_id(), Some("sess-1"));
        }

        #[test]
        fn compaction_states() {
            let events = decode(&[
                r#"{"type":"system","subtype":"status","status":"compacting"}"#,
                r#"{"type":"system","subtype":"compact_boundary"}"#,
            ]);
            assert_eq!(
                events,
                vec![
                    AgentEvent::StateChange {
                        state: AgentState::Compacting
                    },
                    AgentEvent::StateChange {
                        state: AgentState::Idle
                    },
                ]
            );
        }

        #[test]
        fn wrapped_stream_event_delta() {
            let events = decode(&[
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}"#,
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}}"#,
                r#"{"type":"stream_event","event":{"type":"message_start"}}"#,
            ]);
            assert_eq!(
                events,
                vec![AgentEvent::TextDelta {
                    text: "Hel".to_string()
                }]
            );
        }

        #[test]
        fn assistant_text_is_message_complete() {
            let events = decode(&[
                r#"{"type":"assistant","message":{"id":"msg_1","role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Hello "},{"type":"text","text":"there"}]}}"#,
            ]);
            assert_eq!(
                events,
                vec![AgentEvent::MessageComplete {
                    id: Some("msg_1".to_string()),
                    text: "Hello\n\nthere".to_string()
                }]
            );
        }

        #[test]
        fn todo_write_is_task_update() {
            let events = decode(&[
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu_1","name":"TodoWrite","input":{"todos":[{"content":"Read code","status":"completed"},{"id":"t-2","content":"Fix bug","status":"in_progress"},{"content":"Ship","status":"weird"}]}}]}}"#,
            ]);
            assert_eq!(events.len(), 1);
            match &events[0] {
                AgentEvent::TaskUpdate { tasks } => {
                    assert_eq!(tasks.len(), 3);
                    assert_eq!(tasks[0].id, "1");
                    assert_eq!(tasks[0].status, TaskStatus::Completed);
                    assert_eq!(tasks[1].id, "t-2");
                    assert_eq!(tasks[1].status, TaskStatus::InProgress);
                    assert_eq!(tasks[2].status, TaskStatus::Pending);
                }
                other => panic!("Expected TaskUpdate, got {:?}", other),
            }
        }

        #[test]
        fn other_tool_use_is_ignored() {
            let events = decode(&[
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#,
            ]);
            assert!(events.is_empty());
        }

        #[test]
        fn result_returns_to_idle() {
            let events = decode(&[
                r#"{"type":"result","subtype":"success","is_error":false,"result":"done"}"#,
                r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"boom"}"#,
            ]);
            assert_eq!(
                events,
                vec![
                    AgentEvent::StateChange {
                        state: AgentState::Idle
                    },
                    AgentEvent::ProcessError {
                        message: "boom".to_string()
                    },
                    AgentEvent::StateChange {
                        state: AgentState::Idle
                    },
                ]
            );
        }

        #[test]
        fn permission_request() {
            let events = decode(&[
                r#"{"type":"control_request","request_id":"req-1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf build"}}}"#,
            ]);
            assert_eq!(
                events,
                vec![AgentEvent::PermissionRequest {
                    request_id: "req-1".to_string(),
                    tool_name: "Bash".to_string(),
                    input: json!({"command": "rm -rf build"}),
                }]
            );
        }

        #[test]
        fn exit_plan_mode_is_plan_request() {
            let events = decode(&[
                r#"{"type":"control_request","request_id":"req-plan","request":{"subtype":"can_use_tool","tool_name":"ExitPlanMode","input":{"plan":"1. Step one\n2. Step two"}}}"#,
            ]);
            assert_eq!(
                events,
                vec![AgentEvent::PlanRequest {
                    request_id: "req-plan".to_string(),
                    plan: "1. Step one\n2. Step two".to_string(),
                }]
            );
        }

        #[test]
        fn control_request_without_id_is_protocol_error() {
            let events = decode(&[
                r#"{"type":"control_request","request":{"subtype":"can_use_tool","tool_name":"Bash"}}"#,
            ]);
            assert!(matches!(&events[0], AgentEvent::ProtocolError { error, .. } if error.contains("request_id")));
        }

        #[test]
        fn other_control_subtypes_are_skipped() {
            let events = decode(&[
                r#"{"type":"control_request","request_id":"r","request":{"subtype":"hook_callback"}}"#,
            ]);
            assert!(events.is_empty());
        }
    }
}
