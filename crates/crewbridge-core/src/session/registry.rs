//! Registry - the in-memory catalogue of sessions and their agents.
//!
//! Everything a session owns (agents, message buffers, pending approvals,
//! streaming text, connection status) lives inside its [`Session`] record,
//! so removing the session removes all of it.

use std::collections::HashMap;

use thiserror::Error;

use super::state::{
    Agent, AgentState, ConnectionStatus, Message, PendingApproval, Resolution, Session,
    SessionDescriptor, SessionId, TaskItem,
};
use crate::config::DEFAULT_MAX_MESSAGES;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Unknown agent '{name}' in session {session_id}")]
    UnknownAgent { session_id: SessionId, name: String },

    #[error("Agent name already active in this session: {0}")]
    DuplicateName(String),
}

/// Result of a state change that actually happened.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub previous: AgentState,
    pub state: AgentState,
    /// Approvals that expired because the agent reached a terminal state.
    pub expired: Vec<PendingApproval>,
}

pub struct Registry {
    sessions: HashMap<SessionId, Session>,
    message_cap: usize,
}

impl Registry {
    pub fn new(message_cap: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            message_cap: message_cap.max(1),
        }
    }

    /// Create a new session, returns ID for future reference.
    pub fn create(&mut self, label: impl Into<String>, working_dir: impl Into<String>) -> SessionId {
        let id = SessionId::new();
        let session = Session::new(id.clone(), label.into(), working_dir.into());
        self.sessions.insert(id.clone(), session);
        id
    }

    pub fn get(&self, session_id: &SessionId) -> Result<&Session, RegistryError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    pub fn get_mut(&mut self, session_id: &SessionId) -> Result<&mut Session, RegistryError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    /// Descriptors of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionDescriptor> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        sessions.into_iter().map(Session::descriptor).collect()
    }

    /// Remove a session and everything it owns.
    pub fn remove(&mut self, session_id: &SessionId) -> Result<Session, RegistryError> {
        self.sessions
            .remove(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    /// Add an agent, replacing a terminal agent of the same name.
    ///
    /// Returns the replaced agent. Fails if an agent with the name is still
    /// running.
    pub fn insert_agent(
        &mut self,
        session_id: &SessionId,
        agent: Agent,
    ) -> Result<Option<Agent>, RegistryError> {
        let session = self.get_mut(session_id)?;
        if let Some(existing) = session.agents.get(&agent.name) {
            if existing.state.is_running() {
                return Err(RegistryError::DuplicateName(agent.name));
            }
        }

        let name = agent.name.clone();
        session.approvals.retain(|_, a| a.agent != name);
        session.connection_status.remove(&name);
        Ok(session.agents.insert(name, agent))
    }

    /// Remove an agent and the records keyed by its name.
    pub fn remove_agent(&mut self, session_id: &SessionId, name: &str) -> Option<Agent> {
        let session = self.sessions.get_mut(session_id)?;
        session.approvals.retain(|_, a| a.agent != name);
        session.connection_status.remove(name);
        session.agents.remove(name)
    }

    pub fn agent(&self, session_id: &SessionId, name: &str) -> Result<&Agent, RegistryError> {
        self.get(session_id)?
            .agents
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAgent {
                session_id: session_id.clone(),
                name: name.to_string(),
            })
    }

    pub fn agent_mut(
        &mut self,
        session_id: &SessionId,
        name: &str,
    ) -> Result<&mut Agent, RegistryError> {
        self.get_mut(session_id)?
            .agents
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownAgent {
                session_id: session_id.clone(),
                name: name.to_string(),
            })
    }

    /// Append to an agent's history, trimming the oldest entries over the cap.
    pub fn append_message(
        &mut self,
        session_id: &SessionId,
        name: &str,
        message: Message,
    ) -> Result<(), RegistryError> {
        let cap = self.message_cap;
        let agent = self.agent_mut(session_id, name)?;
        agent.messages.push_back(message);
        while agent.messages.len() > cap {
            agent.messages.pop_front();
        }
        Ok(())
    }

    /// Move an agent to `state`.
    ///
    /// Returns `None` when the move is not a transition (same state, or the
    /// agent is already terminal). Entering a terminal state expires the
    /// agent's pending approvals and marks it disconnected.
    pub fn set_state(
        &mut self,
        session_id: &SessionId,
        name: &str,
        state: AgentState,
    ) -> Result<Option<Transition>, RegistryError> {
        let session = self.get_mut(session_id)?;
        let agent = session
            .agents
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownAgent {
                session_id: session_id.clone(),
                name: name.to_string(),
            })?;

        let previous = agent.state;
        if !previous.can_transition_to(state) {
            return Ok(None);
        }
        agent.state = state;

        let mut expired = Vec::new();
        if state.is_terminal() {
            agent.streaming.clear();
            session
                .connection_status
                .insert(name.to_string(), ConnectionStatus::Disconnected);
            expired = take_approvals_for(session, name);
            for approval in &mut expired {
                approval.resolution = Resolution::Expired;
            }
        }

        Ok(Some(Transition {
            previous,
            state,
            expired,
        }))
    }

    /// Put a record back to `Starting` for a new process instance.
    pub fn reset_for_relaunch(
        &mut self,
        session_id: &SessionId,
        name: &str,
        instance: u64,
    ) -> Result<AgentState, RegistryError> {
        let agent = self.agent_mut(session_id, name)?;
        let previous = agent.state;
        agent.state = AgentState::Starting;
        agent.instance = instance;
        agent.process = None;
        agent.settled = None;
        agent.streaming.clear();
        agent.shutdown_requested = false;
        agent.kill_requested = false;
        Ok(previous)
    }

    pub fn push_streaming(
        &mut self,
        session_id: &SessionId,
        name: &str,
        text: &str,
    ) -> Result<(), RegistryError> {
        self.agent_mut(session_id, name)?.streaming.push_str(text);
        Ok(())
    }

    /// Take the streamed text accumulated since the last complete message.
    pub fn take_streaming(
        &mut self,
        session_id: &SessionId,
        name: &str,
    ) -> Result<String, RegistryError> {
        Ok(std::mem::take(&mut self.agent_mut(session_id, name)?.streaming))
    }

    pub fn set_tasks(
        &mut self,
        session_id: &SessionId,
        name: &str,
        tasks: Vec<TaskItem>,
    ) -> Result<(), RegistryError> {
        self.agent_mut(session_id, name)?.tasks = tasks;
        Ok(())
    }

    /// Record a pending approval. Returns `false` if the request id is
    /// already pending.
    pub fn add_pending_approval(
        &mut self,
        session_id: &SessionId,
        approval: PendingApproval,
    ) -> Result<bool, RegistryError> {
        let session = self.get_mut(session_id)?;
        if session.approvals.contains_key(&approval.request_id) {
            return Ok(false);
        }
        session
            .approvals
            .insert(approval.request_id.clone(), approval);
        Ok(true)
    }

    /// Resolve a pending approval at most once.
    ///
    /// Returns the resolved record, or `None` if nothing is pending under the
    /// id (already resolved or expired).
    pub fn resolve_approval(
        &mut self,
        session_id: &SessionId,
        request_id: &str,
        resolution: Resolution,
    ) -> Result<Option<PendingApproval>, RegistryError> {
        let session = self.get_mut(session_id)?;
        Ok(session.approvals.remove(request_id).map(|mut approval| {
            approval.resolution = resolution;
            approval
        }))
    }

    pub fn pending_approval(
        &self,
        session_id: &SessionId,
        request_id: &str,
    ) -> Result<Option<&PendingApproval>, RegistryError> {
        Ok(self.get(session_id)?.approvals.get(request_id))
    }

    /// Pending approvals, oldest first, optionally for one agent.
    pub fn pending_approvals(
        &self,
        session_id: &SessionId,
        agent: Option<&str>,
    ) -> Result<Vec<PendingApproval>, RegistryError> {
        let mut approvals: Vec<PendingApproval> = self
            .get(session_id)?
            .approvals
            .values()
            .filter(|a| agent.map_or(true, |name| a.agent == name))
            .cloned()
            .collect();
        approvals.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(approvals)
    }

    pub fn set_connection(
        &mut self,
        session_id: &SessionId,
        name: &str,
        status: ConnectionStatus,
    ) -> Result<(), RegistryError> {
        self.get_mut(session_id)?
            .connection_status
            .insert(name.to_string(), status);
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

fn take_approvals_for(session: &mut Session, agent: &str) -> Vec<PendingApproval> {
    let ids: Vec<String> = session
        .approvals
        .values()
        .filter(|a| a.agent == agent)
        .map(|a| a.request_id.clone())
        .collect();
    let mut taken: Vec<PendingApproval> = ids
        .iter()
        .filter_map(|id| session.approvals.remove(id))
        .collect();
    taken.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    taken
}
