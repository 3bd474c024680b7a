//! Session, agent, message and approval records.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::agents::AgentConfig;
use crate::logging::{self, LogHandle};
use crate::shell::AgentExit;
use crate::spawn::AgentProcess;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// Being removed; no new agents or messages are accepted.
    Closing,
}

/// Agent lifecycle.
///
/// `Starting` until the process confirms readiness, then one of the running
/// states, and finally one of the terminal states. Terminal states are final
/// for a process instance; only a relaunch resets the record to `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Idle,
    Busy,
    Compacting,
    Exited,
    Killed,
    Failed,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Failed)
    }

    pub fn is_running(self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is a real transition.
    ///
    /// Same-state moves are not transitions, nothing leaves a terminal state
    /// and nothing re-enters `Starting`.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        self != next && !self.is_terminal() && next != Self::Starting
    }

    /// Terminal state for a process exit.
    pub fn for_exit(exit: &AgentExit) -> Self {
        if exit.requested {
            Self::Killed
        } else if exit.code == Some(0) {
            Self::Exited
        } else {
            Self::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent,
    System,
}

/// One entry of an agent's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Message {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            text: text.into(),
            timestamp: Utc::now(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary.filter(|s| !s.is_empty());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Permission,
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Approved,
    Denied,
    /// The agent ended before anyone answered.
    Expired,
}

/// A permission or plan request waiting for a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub request_id: String,
    pub kind: ApprovalKind,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool input for permissions, `{"plan": ...}` for plans.
    pub payload: serde_json::Value,
    pub resolution: Resolution,
    pub created_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn permission(
        agent: &str,
        request_id: String,
        tool_name: String,
        input: serde_json::Value,
    ) -> Self {
        Self {
            request_id,
            kind: ApprovalKind::Permission,
            agent: agent.to_string(),
            tool_name: Some(tool_name),
            payload: input,
            resolution: Resolution::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn plan(agent: &str, request_id: String, plan: String) -> Self {
        Self {
            request_id,
            kind: ApprovalKind::Plan,
            agent: agent.to_string(),
            tool_name: None,
            payload: serde_json::json!({ "plan": plan }),
            resolution: Resolution::Pending,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    /// Parse an agent-reported status; anything unrecognised is pending.
    pub fn parse(status: &str) -> Self {
        match status {
            "in_progress" | "inProgress" | "in-progress" => Self::InProgress,
            "completed" | "done" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// A named agent inside a session.
pub struct Agent {
    pub name: String,
    pub config: AgentConfig,
    pub state: AgentState,
    /// Process instance counter; events from other instances are stale.
    pub instance: u64,
    /// The only long-lived handle to the process.
    pub process: Option<Arc<AgentProcess>>,
    pub log: LogHandle,
    /// Flips to `true` once the current instance's events are fully applied.
    pub settled: Option<watch::Receiver<bool>>,
    pub messages: VecDeque<Message>,
    /// Reply text streamed since the last complete message.
    pub streaming: String,
    pub tasks: Vec<TaskItem>,
    /// Conversation id reported by the agent, used to resume on relaunch.
    pub remote_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_exit: Option<AgentExit>,
    /// An interrupt was written and stdin closed; repeats are no-ops.
    pub shutdown_requested: bool,
    /// Kill asked for before the process existed; applied once it does.
    pub kill_requested: bool,
}

impl Agent {
    pub fn new(name: impl Into<String>, config: AgentConfig, instance: u64) -> Self {
        Self {
            name: name.into(),
            config,
            state: AgentState::Starting,
            instance,
            process: None,
            log: logging::disabled(),
            settled: None,
            messages: VecDeque::new(),
            streaming: String::new(),
            tasks: Vec::new(),
            remote_session_id: None,
            created_at: Utc::now(),
            last_exit: None,
            shutdown_requested: false,
            kill_requested: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    pub fn descriptor(&self, connection: Option<ConnectionStatus>, pending: usize) -> AgentDescriptor {
        AgentDescriptor {
            name: self.name.clone(),
            state: self.state,
            model: self.config.model.clone(),
            permission_mode: self.config.permission_mode.clone(),
            pid: self.pid(),
            connection: connection.unwrap_or(ConnectionStatus::Disconnected),
            message_count: self.messages.len(),
            pending_approvals: pending,
            tasks: self.tasks.clone(),
            remote_session_id: self.remote_session_id.clone(),
            last_exit: self.last_exit.clone(),
            created_at: self.created_at,
        }
    }
}

/// A unit of work owning one or more named agents.
pub struct Session {
    pub id: SessionId,
    pub label: String,
    pub working_dir: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub agents: HashMap<String, Agent>,
    /// Pending approvals keyed by request id.
    pub approvals: HashMap<String, PendingApproval>,
    pub connection_status: HashMap<String, ConnectionStatus>,
}

impl Session {
    pub fn new(id: SessionId, label: String, working_dir: String) -> Self {
        Self {
            id,
            label,
            working_dir,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            agents: HashMap::new(),
            approvals: HashMap::new(),
            connection_status: HashMap::new(),
        }
    }

    pub fn agent_descriptor(&self, agent: &Agent) -> AgentDescriptor {
        let pending = self
            .approvals
            .values()
            .filter(|a| a.agent == agent.name)
            .count();
        agent.descriptor(self.connection_status.get(&agent.name).copied(), pending)
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        let mut agents: Vec<AgentDescriptor> = self
            .agents
            .values()
            .map(|agent| self.agent_descriptor(agent))
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));

        SessionDescriptor {
            id: self.id.clone(),
            label: self.label.clone(),
            working_dir: self.working_dir.clone(),
            status: self.status,
            created_at: self.created_at,
            agents,
        }
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub label: String,
    pub working_dir: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub agents: Vec<AgentDescriptor>,
}

/// Serializable view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub name: String,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub connection: ConnectionStatus,
    pub message_count: usize,
    pub pending_approvals: usize,
    pub tasks: Vec<TaskItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<AgentExit>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod session_id {
        use super::*;

        #[test]
        fn new_generates_unique_ids() {
            assert_ne!(SessionId::new(), SessionId::new());
        }

        #[test]
        fn display_shows_inner_string() {
            let id = SessionId("test-session-123".to_string());
            assert_eq!(format!("{}", id), "test-session-123");
        }

        #[test]
        fn serializes_as_plain_string() {
            let id = SessionId::from("abc");
            assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        }
    }

    mod agent_state {
        use super::*;

        #[test]
        fn terminal_states_are_final() {
            for terminal in [AgentState::Exited, AgentState::Killed, AgentState::Failed] {
                assert!(terminal.is_terminal());
                assert!(!terminal.can_transition_to(AgentState::Idle));
                assert!(!terminal.can_transition_to(AgentState::Starting));
                assert!(!terminal.can_transition_to(AgentState::Failed));
            }
        }

        #[test]
        fn running_transitions() {
            assert!(AgentState::Starting.can_transition_to(AgentState::Idle));
            assert!(AgentState::Idle.can_transition_to(AgentState::Busy));
            assert!(AgentState::Busy.can_transition_to(AgentState::Compacting));
            assert!(AgentState::Busy.can_transition_to(AgentState::Exited));
            assert!(!AgentState::Idle.can_transition_to(AgentState::Idle));
            assert!(!AgentState::Idle.can_transition_to(AgentState::Starting));
        }

        #[test]
        fn exit_classification() {
            let exit = |code, signal, requested| AgentExit {
                code,
                signal,
                requested,
            };
            assert_eq!(AgentState::for_exit(&exit(Some(0), None, false)), AgentState::Exited);
            assert_eq!(AgentState::for_exit(&exit(Some(2), None, false)), AgentState::Failed);
            assert_eq!(AgentState::for_exit(&exit(None, Some(9), false)), AgentState::Failed);
            assert_eq!(AgentState::for_exit(&exit(None, Some(15), true)), AgentState::Killed);
            assert_eq!(AgentState::for_exit(&exit(Some(0), None, true)), AgentState::Killed);
        }

        #[test]
        fn serializes_snake_case() {
            assert_eq!(serde_json::to_string(&AgentState::Compacting).unwrap(), "\"compacting\"");
        }
    }

    mod records {
        use super::*;

        #[test]
        fn task_status_parsing() {
            assert_eq!(TaskStatus::parse("in_progress"), TaskStatus::InProgress);
            assert_eq!(TaskStatus::parse("completed"), TaskStatus::Completed);
            assert_eq!(TaskStatus::parse("pending"), TaskStatus::Pending);
            assert_eq!(TaskStatus::parse("???"), TaskStatus::Pending);
        }

        #[test]
        fn plan_payload_wraps_text() {
            let approval = PendingApproval::plan("planner", "req-1".to_string(), "Do it".to_string());
            assert_eq!(approval.payload["plan"], "Do it");
            assert_eq!(approval.kind, ApprovalKind::Plan);
            assert_eq!(approval.resolution, Resolution::Pending);
        }

        #[test]
        fn empty_summary_is_dropped() {
            let message = Message::new(Sender::User, "hi").with_summary(Some(String::new()));
            assert!(message.summary.is_none());
            let json = serde_json::to_string(&message).unwrap();
            assert!(!json.contains("summary"));
        }

        #[test]
        fn session_descriptor_lists_agents_in_creation_order() {
            let mut session = Session::new(SessionId::from("s"), "label".to_string(), "/tmp".to_string());
            let mut first = Agent::new("zeta", AgentConfig::default(), 1);
            first.created_at = Utc::now() - chrono::Duration::seconds(5);
            session.agents.insert("zeta".to_string(), first);
            session
                .agents
                .insert("alpha".to_string(), Agent::new("alpha", AgentConfig::default(), 2));

            let descriptor = session.descriptor();
            let names: Vec<_> = descriptor.agents.iter().map(|a| a.name.as_str()).collect();
            assert_eq!(names, vec!["zeta", "alpha"]);
            assert_eq!(descriptor.agents[0].connection, ConnectionStatus::Disconnected);
        }
    }
}
