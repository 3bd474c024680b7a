//! Shared helpers: fake stream-json agents written as shell scripts.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crewbridge_core::bridge::{BridgeEvent, Observer};
use crewbridge_core::session::{AgentState, SessionId};
use crewbridge_core::{AgentConfig, Controller, ControllerConfig, EnvBundleStore, InMemoryEnvBundles};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Agent that greets on start and answers every user message with
/// "Hel" + "lo" deltas, a complete "Hello" and a result. Records its
/// arguments in `args.txt` and exits cleanly on an interrupt.
pub const ECHO_AGENT: &str = r#"#!/bin/sh
echo "$@" > args.txt
echo '{"type":"system","subtype":"init","session_id":"fake-1"}'
while IFS= read -r line; do
  case "$line" in
    *'"subtype":"interrupt"'*)
      exit 0
      ;;
    *'"type":"user"'*)
      echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}'
      echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}}'
      echo '{"type":"assistant","message":{"id":"msg_1","content":[{"type":"text","text":"Hello"}]}}'
      echo '{"type":"result","subtype":"success","is_error":false}'
      ;;
  esac
done
"#;

/// Agent that starts a reply and then dies.
pub const CRASHING_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"fake-2"}'
read -r line
echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Half a"}}}'
exit 0
"#;

/// Agent that asks permission for every user message and reports the answer.
pub const PERMISSION_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"fake-3"}'
while IFS= read -r line; do
  case "$line" in
    *'"behavior":"allow"'*)
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"allowed"}]}}'
      echo '{"type":"result","subtype":"success","is_error":false}'
      ;;
    *'"behavior":"deny"'*)
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"denied"}]}}'
      echo '{"type":"result","subtype":"success","is_error":false}'
      ;;
    *'"type":"user"'*)
      echo '{"type":"control_request","request_id":"req-1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf build"}}}'
      ;;
  esac
done
"#;

/// Agent that proposes a plan for every user message and reports how the
/// decision it received read.
pub const PLAN_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"fake-4"}'
while IFS= read -r line; do
  case "$line" in
    *'"updatedInput":{"plan":"Write tests first"}'*)
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"plan approved"}]}}'
      echo '{"type":"result","subtype":"success","is_error":false}'
      ;;
    *'"behavior":"deny","message":"Split it up"'*)
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"plan rejected: Split it up"}]}}'
      echo '{"type":"result","subtype":"success","is_error":false}'
      ;;
    *'"type":"control_response"'*)
      echo '{"type":"assistant","message":{"content":[{"type":"text","text":"unexpected decision"}]}}'
      ;;
    *'"type":"user"'*)
      echo '{"type":"control_request","request_id":"plan-1","request":{"subtype":"can_use_tool","tool_name":"ExitPlanMode","input":{"plan":"Write tests first"}}}'
      ;;
  esac
done
"#;

/// Agent that announces itself and then never reads its input.
pub const STALLED_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"fake-5"}'
exec sleep 30
"#;

/// Agent that reports its environment.
pub const ENV_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init"}'
echo "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"token=$CREW_TOKEN region=$CREW_REGION\"}]}}"
while IFS= read -r line; do :; done
"#;

pub struct Harness {
    pub controller: Arc<Controller>,
    pub session_id: SessionId,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), Arc::new(InMemoryEnvBundles::new()))
    }

    pub fn with(config: ControllerConfig, bundles: Arc<dyn EnvBundleStore>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(Controller::new(config, bundles));
        let session = controller
            .create_session("test", dir.path().to_str().unwrap())
            .unwrap();
        Self {
            controller,
            session_id: session.id,
            dir,
        }
    }

    /// Write an executable script into the session directory.
    pub fn script(&self, name: &str, body: &str) -> AgentConfig {
        AgentConfig::new(write_script(self.dir.path(), name, body).to_str().unwrap())
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        kill_grace: Duration::from_millis(500),
        kill_escalation: Duration::from_secs(2),
        ..ControllerConfig::default()
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Collect events until one matches `done` (inclusive).
pub async fn collect_until(
    observer: &mut Observer,
    mut done: impl FnMut(&BridgeEvent) -> bool,
) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    let result = tokio::time::timeout(TIMEOUT, async {
        while let Some(event) = observer.recv().await {
            let finished = done(&event);
            events.push(event);
            if finished {
                return true;
            }
        }
        false
    })
    .await;
    assert!(matches!(result, Ok(true)), "condition not reached; got {:#?}", events);
    events
}

/// A live state change to `wanted`, or a snapshot already in that state.
pub fn is_state(event: &BridgeEvent, wanted: AgentState) -> bool {
    match event {
        BridgeEvent::StateChange { state, .. } => *state == wanted,
        BridgeEvent::AgentSnapshot { descriptor, .. } => descriptor.state == wanted,
        _ => false,
    }
}

pub fn is_agent_text(event: &BridgeEvent, text: &str) -> bool {
    matches!(event, BridgeEvent::Message { message, .. }
        if message.sender == crewbridge_core::session::Sender::Agent && message.text == text)
}

pub fn is_user_text(event: &BridgeEvent, text: &str) -> bool {
    matches!(event, BridgeEvent::Message { message, .. }
        if message.sender == crewbridge_core::session::Sender::User && message.text == text)
}

/// Wait until the agent is idle (after readiness or a finished reply).
pub async fn wait_idle(observer: &mut Observer) {
    collect_until(observer, |e| is_state(e, AgentState::Idle)).await;
}

pub fn drain(observer: &mut Observer) -> Vec<BridgeEvent> {
    std::iter::from_fn(|| observer.try_recv()).collect()
}
