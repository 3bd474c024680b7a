//! Controller - routes caller intents to agents and agent output to observers.
//!
//! The [`Registry`] and the [`EventBridge`] sit behind a single mutex. Every
//! registry mutation and every broadcast happens while holding it, which
//! gives observers a single ordering point: an observer attached at any
//! moment sees the state up to that moment as replay and everything after it
//! live. The lock is never held across an `.await`.
//!
//! Each process instance gets one pump task that reads its
//! [`ProcessEvent`]s in order, decodes stdout, and applies the resulting
//! events. Events of a superseded instance (after a relaunch) are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::agents::{AgentConfig, AgentEvent, StreamDecoder};
use crate::bridge::{BridgeEvent, EventBridge, Observer, ObserverHandle};
use crate::config::{BundlePolicy, ControllerConfig};
use crate::env_bundle::{merge_env, EnvBundleStore, NoEnvBundles};
use crate::error::CoreError;
use crate::logging::{self, log_line, LogHandle};
use crate::session::{
    Agent, AgentDescriptor, AgentState, ApprovalKind, ConnectionStatus, Message, PendingApproval,
    Registry, Resolution, Sender, SessionDescriptor, SessionId, SessionStatus,
};
use crate::shell::AgentExit;
use crate::spawn::{AgentProcess, ProcessEvent, SpawnConfig};

/// Extra time allowed for a pump to apply an exit after the process is gone.
const SETTLE_SLACK: Duration = Duration::from_secs(1);

/// Result of answering an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// The answer was written to the agent.
    Forwarded,
    /// Nothing was pending under the request id; no-op.
    AlreadyResolved,
}

struct Inner {
    registry: Registry,
    bridge: EventBridge,
}

impl Inner {
    fn broadcast(&mut self, session_id: &SessionId, event: BridgeEvent) {
        self.bridge.broadcast(session_id, event);
    }

    /// Apply a state change and announce it, with any approvals it expired.
    fn transition(&mut self, session_id: &SessionId, name: &str, state: AgentState) {
        let transition = match self.registry.set_state(session_id, name, state) {
            Ok(Some(transition)) => transition,
            Ok(None) => return,
            Err(e) => {
                log::debug!("Dropping state change for {}/{}: {}", session_id, name, e);
                return;
            }
        };

        log::info!(
            "Agent {}/{}: {:?} -> {:?}",
            session_id,
            name,
            transition.previous,
            transition.state
        );
        self.broadcast(
            session_id,
            BridgeEvent::StateChange {
                agent: name.to_string(),
                state: transition.state,
                previous: Some(transition.previous),
            },
        );
        for approval in transition.expired {
            self.broadcast(
                session_id,
                BridgeEvent::ApprovalResolved {
                    agent: approval.agent,
                    request_id: approval.request_id,
                    resolution: approval.resolution,
                },
            );
        }
    }

    fn snapshot(&mut self, session_id: &SessionId, name: &str) -> Option<AgentDescriptor> {
        let session = self.registry.get(session_id).ok()?;
        let descriptor = session.agent_descriptor(session.agents.get(name)?);
        self.broadcast(
            session_id,
            BridgeEvent::AgentSnapshot {
                agent: name.to_string(),
                descriptor: descriptor.clone(),
            },
        );
        Some(descriptor)
    }

    /// Whether `instance` is still the live instance of the agent.
    fn is_current(&self, session_id: &SessionId, name: &str, instance: u64) -> bool {
        self.registry
            .agent(session_id, name)
            .map(|agent| agent.instance == instance)
            .unwrap_or(false)
    }

    fn apply_agent_event(&mut self, session_id: &SessionId, name: &str, event: AgentEvent) {
        let agent = name.to_string();
        match event {
            AgentEvent::Ready { session_id: remote } => {
                let starting = match self.registry.agent_mut(session_id, name) {
                    Ok(record) => {
                        if remote.is_some() {
                            record.remote_session_id = remote;
                        }
                        record.state == AgentState::Starting
                    }
                    Err(_) => return,
                };
                if starting {
                    self.transition(session_id, name, AgentState::Idle);
                }
            }

            AgentEvent::TextDelta { text } => {
                if self.registry.push_streaming(session_id, name, &text).is_ok() {
                    self.broadcast(session_id, BridgeEvent::TextDelta { agent, text });
                }
            }

            AgentEvent::MessageComplete { text, .. } => {
                let message = Message::new(Sender::Agent, text);
                let _ = self.registry.take_streaming(session_id, name);
                if self
                    .registry
                    .append_message(session_id, name, message.clone())
                    .is_ok()
                {
                    self.broadcast(session_id, BridgeEvent::Message { agent, message });
                }
            }

            AgentEvent::PermissionRequest {
                request_id,
                tool_name,
                input,
            } => {
                let approval = PendingApproval::permission(name, request_id, tool_name, input);
                self.add_approval(session_id, approval);
            }

            AgentEvent::PlanRequest { request_id, plan } => {
                self.add_approval(session_id, PendingApproval::plan(name, request_id, plan));
            }

            AgentEvent::TaskUpdate { tasks } => {
                if self
                    .registry
                    .set_tasks(session_id, name, tasks.clone())
                    .is_ok()
                {
                    self.broadcast(session_id, BridgeEvent::TaskUpdate { agent, tasks });
                }
            }

            AgentEvent::StateChange { state } => {
                if !state.is_terminal() {
                    self.transition(session_id, name, state);
                }
            }

            AgentEvent::ProcessError { message } => {
                log::warn!("Agent {}/{} reported an error: {}", session_id, name, message);
                self.broadcast(session_id, BridgeEvent::ProcessError { agent, message });
            }

            AgentEvent::ProtocolError { raw, error } => {
                log::warn!(
                    "Agent {}/{} wrote an undecodable record ({}): {}",
                    session_id,
                    name,
                    error,
                    raw
                );
                self.broadcast(session_id, BridgeEvent::ProtocolError { agent, raw, error });
            }
        }
    }

    fn add_approval(&mut self, session_id: &SessionId, approval: PendingApproval) {
        match self.registry.add_pending_approval(session_id, approval.clone()) {
            Ok(true) => self.broadcast(session_id, BridgeEvent::for_approval(approval)),
            Ok(false) => log::debug!(
                "Ignoring repeated approval request {} in session {}",
                approval.request_id,
                session_id
            ),
            Err(e) => log::debug!("Dropping approval request: {}", e),
        }
    }

    /// Record the end of a process instance.
    fn apply_exit(&mut self, session_id: &SessionId, name: &str, exit: AgentExit) {
        let Ok(agent) = self.registry.agent_mut(session_id, name) else {
            return;
        };
        agent.process = None;
        agent.last_exit = Some(exit.clone());
        self.transition(session_id, name, AgentState::for_exit(&exit));
    }
}

/// Orchestrates sessions, agents and observers.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Controller {
    config: ControllerConfig,
    bundles: Arc<dyn EnvBundleStore>,
    inner: Arc<Mutex<Inner>>,
    instances: AtomicU64,
}

impl Controller {
    pub fn new(config: ControllerConfig, bundles: Arc<dyn EnvBundleStore>) -> Self {
        let inner = Inner {
            registry: Registry::new(config.max_messages_per_agent),
            bridge: EventBridge::new(config.observer_capacity),
        };
        Self {
            config,
            bundles,
            inner: Arc::new(Mutex::new(inner)),
            instances: AtomicU64::new(1),
        }
    }

    /// A controller with no environment-bundle store.
    pub fn without_bundles(config: ControllerConfig) -> Self {
        Self::new(config, Arc::new(NoEnvBundles))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_instance(&self) -> u64 {
        self.instances.fetch_add(1, Ordering::Relaxed)
    }

    fn settle_bound(&self, grace: Duration) -> Duration {
        grace + self.config.kill_escalation + SETTLE_SLACK
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn create_session(
        &self,
        label: &str,
        working_dir: &str,
    ) -> Result<SessionDescriptor, CoreError> {
        if working_dir.trim().is_empty() {
            return Err(CoreError::Invalid("working directory is required".to_string()));
        }
        if !std::path::Path::new(working_dir).is_dir() {
            return Err(CoreError::Invalid(format!(
                "working directory does not exist: {}",
                working_dir
            )));
        }

        let mut inner = self.lock();
        let id = inner.registry.create(label, working_dir);
        log::info!("Created session {} ({}) in {}", id, label, working_dir);
        Ok(inner.registry.get(&id)?.descriptor())
    }

    pub fn list_sessions(&self) -> Vec<SessionDescriptor> {
        self.lock().registry.list()
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<SessionDescriptor, CoreError> {
        Ok(self.lock().registry.get(session_id)?.descriptor())
    }

    /// Messages buffered for one agent, oldest first.
    pub fn agent_messages(
        &self,
        session_id: &SessionId,
        name: &str,
    ) -> Result<Vec<Message>, CoreError> {
        let inner = self.lock();
        Ok(inner
            .registry
            .agent(session_id, name)?
            .messages
            .iter()
            .cloned()
            .collect())
    }

    /// Force-kill every agent of the session, then forget the session and
    /// disconnect its observers.
    pub async fn remove_session(&self, session_id: &SessionId) -> Result<(), CoreError> {
        let targets = {
            let mut inner = self.lock();
            let session = inner.registry.get_mut(session_id)?;
            if session.status == SessionStatus::Closing {
                return Err(CoreError::SessionClosing(session_id.clone()));
            }
            session.status = SessionStatus::Closing;
            session
                .agents
                .values()
                .filter_map(|agent| {
                    agent
                        .process
                        .as_ref()
                        .map(|process| (Arc::clone(process), agent.settled.clone()))
                })
                .collect::<Vec<_>>()
        };

        let bound = self.settle_bound(Duration::ZERO);
        let mut kills = JoinSet::new();
        for (process, settled) in targets {
            kills.spawn(async move {
                process.kill(Duration::ZERO).await;
                if let Some(settled) = settled {
                    wait_settled(settled, bound).await;
                }
            });
        }
        while kills.join_next().await.is_some() {}

        let mut inner = self.lock();
        inner.registry.remove(session_id)?;
        inner.bridge.close_session(session_id);
        log::info!("Removed session {}", session_id);
        Ok(())
    }

    /// Remove every session.
    pub async fn shutdown(&self) {
        let ids = self.lock().registry.session_ids();
        for id in ids {
            if let Err(e) = self.remove_session(&id).await {
                log::warn!("Failed to remove session {} during shutdown: {}", id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Start a new named agent in the session.
    ///
    /// A terminal agent with the same name is replaced; a running one makes
    /// the call fail. If the process cannot be started the replaced record
    /// (if any) is put back, otherwise nothing is recorded.
    pub async fn spawn_agent(
        &self,
        session_id: &SessionId,
        name: &str,
        config: AgentConfig,
    ) -> Result<AgentDescriptor, CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::Invalid("agent name is required".to_string()));
        }

        let env = self.resolve_env(&config)?;
        let instance = self.next_instance();

        let (working_dir, replaced) = {
            let mut inner = self.lock();
            let session = inner.registry.get(session_id)?;
            if session.status == SessionStatus::Closing {
                return Err(CoreError::SessionClosing(session_id.clone()));
            }
            let working_dir = session.working_dir.clone();
            let replaced = inner
                .registry
                .insert_agent(session_id, Agent::new(name, config.clone(), instance))?;
            (working_dir, replaced)
        };

        let spawn_config = config.build(
            &working_dir,
            env,
            None,
            self.config.send_timeout,
            self.config.kill_escalation,
        );

        match self.launch(session_id, name, instance, spawn_config).await {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                let mut inner = self.lock();
                if inner.is_current(session_id, name, instance) {
                    inner.registry.remove_agent(session_id, name);
                    if let Some(previous) = replaced {
                        // Keeps the terminal agent's history inspectable.
                        let restored = inner
                            .registry
                            .insert_agent(session_id, previous)
                            .and_then(|_| {
                                inner.registry.set_connection(
                                    session_id,
                                    name,
                                    ConnectionStatus::Disconnected,
                                )
                            });
                        if let Err(err) = restored {
                            log::warn!("Failed to restore agent {}/{}: {}", session_id, name, err);
                        }
                    }
                }
                log::warn!("Failed to spawn agent {}/{}: {}", session_id, name, e);
                Err(e)
            }
        }
    }

    /// Start a fresh process for an existing agent from its stored
    /// configuration, resuming its conversation when the agent reported one.
    ///
    /// A running agent is killed first.
    pub async fn relaunch_agent(
        &self,
        session_id: &SessionId,
        name: &str,
    ) -> Result<AgentDescriptor, CoreError> {
        let running = {
            let inner = self.lock();
            let session = inner.registry.get(session_id)?;
            if session.status == SessionStatus::Closing {
                return Err(CoreError::SessionClosing(session_id.clone()));
            }
            let agent = inner.registry.agent(session_id, name)?;
            agent
                .process
                .as_ref()
                .map(|process| (Arc::clone(process), agent.settled.clone()))
        };

        if let Some((process, settled)) = running {
            process.kill(self.config.kill_grace).await;
            if let Some(settled) = settled {
                wait_settled(settled, self.settle_bound(self.config.kill_grace)).await;
            }
        }

        let instance = self.next_instance();
        let (config, resume, working_dir) = {
            let mut inner = self.lock();
            let previous = inner.registry.reset_for_relaunch(session_id, name, instance)?;
            inner.broadcast(
                session_id,
                BridgeEvent::StateChange {
                    agent: name.to_string(),
                    state: AgentState::Starting,
                    previous: Some(previous),
                },
            );
            let working_dir = inner.registry.get(session_id)?.working_dir.clone();
            let agent = inner.registry.agent(session_id, name)?;
            (agent.config.clone(), agent.remote_session_id.clone(), working_dir)
        };

        let result = match self.resolve_env(&config) {
            Ok(env) => {
                let spawn_config = config.build(
                    &working_dir,
                    env,
                    resume.as_deref(),
                    self.config.send_timeout,
                    self.config.kill_escalation,
                );
                self.launch(session_id, name, instance, spawn_config).await
            }
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            let mut inner = self.lock();
            if inner.is_current(session_id, name, instance) {
                inner.broadcast(
                    session_id,
                    BridgeEvent::ProcessError {
                        agent: name.to_string(),
                        message: format!("Relaunch failed: {}", e),
                    },
                );
                inner.transition(session_id, name, AgentState::Failed);
            }
            log::warn!("Failed to relaunch agent {}/{}: {}", session_id, name, e);
        }
        result
    }

    /// Spawn the process for a reserved `Starting` record and start its pump.
    async fn launch(
        &self,
        session_id: &SessionId,
        name: &str,
        instance: u64,
        spawn_config: SpawnConfig,
    ) -> Result<AgentDescriptor, CoreError> {
        let (process, events) = AgentProcess::spawn(spawn_config).await?;
        let process = Arc::new(process);
        let log = logging::open_log_file(
            self.config.log_dir.as_deref(),
            &format!("{}-{}", session_id, name),
        );
        let (settled_tx, settled_rx) = watch::channel(false);

        let (descriptor, kill_requested) = {
            let mut inner = self.lock();
            match inner.registry.get(session_id) {
                Ok(session) if session.status == SessionStatus::Closing => {
                    return Err(CoreError::SessionClosing(session_id.clone()));
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
            if !inner.is_current(session_id, name, instance) {
                return Err(CoreError::Invalid(format!(
                    "agent '{}' was replaced while starting",
                    name
                )));
            }

            let agent = inner.registry.agent_mut(session_id, name)?;
            agent.process = Some(Arc::clone(&process));
            agent.log = Arc::clone(&log);
            agent.settled = Some(settled_rx);
            let kill_requested = std::mem::take(&mut agent.kill_requested);
            inner
                .registry
                .set_connection(session_id, name, ConnectionStatus::Connected)?;
            let descriptor = inner
                .snapshot(session_id, name)
                .ok_or_else(|| CoreError::UnknownAgent {
                    session_id: session_id.clone(),
                    name: name.to_string(),
                })?;
            (descriptor, kill_requested)
        };

        log::info!(
            "Agent {}/{} started (pid {:?}, instance {})",
            session_id,
            name,
            process.pid(),
            instance
        );

        tokio::spawn(pump(
            Arc::clone(&self.inner),
            session_id.clone(),
            name.to_string(),
            instance,
            events,
            log,
            settled_tx,
        ));

        if kill_requested {
            log::info!("Applying kill requested while {}/{} was starting", session_id, name);
            self.kill_agent(session_id, name).await?;
            let inner = self.lock();
            let session = inner.registry.get(session_id)?;
            return Ok(session.agent_descriptor(inner.registry.agent(session_id, name)?));
        }

        Ok(descriptor)
    }

    /// Merge the agent's bundle (if any) with its explicit environment.
    fn resolve_env(
        &self,
        config: &AgentConfig,
    ) -> Result<std::collections::BTreeMap<String, String>, CoreError> {
        let Some(slug) = config.env_bundle.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(config.env.clone());
        };
        match self.bundles.lookup(slug) {
            Ok(bundle) => Ok(merge_env(bundle, &config.env)),
            Err(e) => match self.config.bundle_policy {
                BundlePolicy::Abort => Err(e.into()),
                BundlePolicy::Proceed => {
                    log::warn!("Spawning without environment bundle '{}': {}", slug, e);
                    Ok(config.env.clone())
                }
            },
        }
    }

    /// Send a user message to an agent.
    ///
    /// The message is recorded and broadcast before it is written, so every
    /// observer sees it ahead of the reply.
    ///
    /// If the write fails the message stays on record, a process error is
    /// broadcast and the agent goes back to its previous state.
    pub async fn send(
        &self,
        session_id: &SessionId,
        name: &str,
        text: &str,
        summary: Option<String>,
    ) -> Result<Message, CoreError> {
        let (message, process, log, previous, instance) = {
            let mut inner = self.lock();
            let session = inner.registry.get(session_id)?;
            if session.status == SessionStatus::Closing {
                return Err(CoreError::SessionClosing(session_id.clone()));
            }
            let agent = inner.registry.agent(session_id, name)?;
            let process = match (&agent.process, agent.state.is_running()) {
                (Some(process), true) if process.is_running() => Arc::clone(process),
                _ => return Err(CoreError::NotRunning(name.to_string())),
            };
            let log = Arc::clone(&agent.log);
            let (previous, instance) = (agent.state, agent.instance);

            let message = Message::new(Sender::User, text).with_summary(summary);
            inner
                .registry
                .append_message(session_id, name, message.clone())?;
            inner.broadcast(
                session_id,
                BridgeEvent::Message {
                    agent: name.to_string(),
                    message: message.clone(),
                },
            );
            inner.transition(session_id, name, AgentState::Busy);
            (message, process, log, previous, instance)
        };

        let payload = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": text,
            }
        })
        .to_string();
        if let Err(e) = write_to(&process, &log, name, &payload).await {
            // The message is on record but never reached the agent.
            let mut inner = self.lock();
            if inner.is_current(session_id, name, instance) {
                inner.broadcast(
                    session_id,
                    BridgeEvent::ProcessError {
                        agent: name.to_string(),
                        message: format!("Message not delivered: {}", e),
                    },
                );
                inner.transition(session_id, name, previous);
            }
            return Err(e);
        }
        Ok(message)
    }

    /// Answer a permission request.
    pub async fn send_permission_response(
        &self,
        session_id: &SessionId,
        request_id: &str,
        approved: bool,
        message: Option<String>,
    ) -> Result<ApprovalOutcome, CoreError> {
        self.answer(session_id, request_id, ApprovalKind::Permission, approved, message)
            .await
    }

    /// Approve or reject a plan, with optional feedback on rejection.
    pub async fn send_plan_approval(
        &self,
        session_id: &SessionId,
        request_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<ApprovalOutcome, CoreError> {
        self.answer(session_id, request_id, ApprovalKind::Plan, approved, feedback)
            .await
    }

    async fn answer(
        &self,
        session_id: &SessionId,
        request_id: &str,
        kind: ApprovalKind,
        approved: bool,
        message: Option<String>,
    ) -> Result<ApprovalOutcome, CoreError> {
        let (approval, process, log) = {
            let mut inner = self.lock();
            let Some(pending) = inner.registry.pending_approval(session_id, request_id)? else {
                log::debug!("Approval {} already resolved", request_id);
                return Ok(ApprovalOutcome::AlreadyResolved);
            };
            if pending.kind != kind {
                return Err(CoreError::Invalid(format!(
                    "request {} is a {:?} request",
                    request_id, pending.kind
                )));
            }

            let agent = inner.registry.agent(session_id, &pending.agent)?;
            let process = agent.process.clone();
            let log = Arc::clone(&agent.log);

            let resolution = if approved {
                Resolution::Approved
            } else {
                Resolution::Denied
            };
            let Some(approval) = inner
                .registry
                .resolve_approval(session_id, request_id, resolution)?
            else {
                return Ok(ApprovalOutcome::AlreadyResolved);
            };
            inner.broadcast(
                session_id,
                BridgeEvent::ApprovalResolved {
                    agent: approval.agent.clone(),
                    request_id: approval.request_id.clone(),
                    resolution,
                },
            );
            (approval, process, log)
        };

        let Some(process) = process else {
            return Err(CoreError::NotRunning(approval.agent));
        };

        let decision = if approved {
            serde_json::json!({
                "behavior": "allow",
                "updatedInput": approval.payload,
            })
        } else {
            let fallback = match kind {
                ApprovalKind::Permission => "User denied permission",
                ApprovalKind::Plan => "User rejected the plan",
            };
            serde_json::json!({
                "behavior": "deny",
                "message": message.filter(|m| !m.trim().is_empty()).unwrap_or_else(|| fallback.to_string()),
            })
        };
        let payload = serde_json::json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": approval.request_id,
                "response": decision,
            }
        })
        .to_string();

        write_to(&process, &log, &approval.agent, &payload).await?;
        Ok(ApprovalOutcome::Forwarded)
    }

    /// Force-terminate an agent. A no-op for an agent that is not running.
    ///
    /// An agent whose process is still being started is marked instead; the
    /// kill is applied as soon as the process exists.
    pub async fn kill_agent(&self, session_id: &SessionId, name: &str) -> Result<(), CoreError> {
        let running = {
            let mut inner = self.lock();
            let agent = inner.registry.agent_mut(session_id, name)?;
            if agent.state.is_terminal() {
                None
            } else if let Some(process) = &agent.process {
                Some((Arc::clone(process), agent.settled.clone()))
            } else {
                agent.kill_requested = true;
                log::info!("Agent {}/{} is starting, kill deferred", session_id, name);
                return Ok(());
            }
        };

        let Some((process, settled)) = running else {
            log::debug!("Agent {}/{} is not running, nothing to kill", session_id, name);
            return Ok(());
        };

        log::info!("Killing agent {}/{}", session_id, name);
        process.kill(self.config.kill_grace).await;
        if let Some(settled) = settled {
            wait_settled(settled, self.settle_bound(self.config.kill_grace)).await;
        }
        Ok(())
    }

    /// Ask an agent to stop on its own: interrupt, then close its input.
    ///
    /// Returns once the request is written; the exit shows up later as a
    /// state change.
    pub async fn send_shutdown_request(
        &self,
        session_id: &SessionId,
        name: &str,
    ) -> Result<(), CoreError> {
        let (process, log) = {
            let mut inner = self.lock();
            let agent = inner.registry.agent_mut(session_id, name)?;
            let process = match (&agent.process, agent.state.is_running()) {
                (Some(process), true) => Arc::clone(process),
                _ => return Err(CoreError::NotRunning(name.to_string())),
            };
            if agent.shutdown_requested {
                log::debug!("Shutdown of agent {}/{} already requested", session_id, name);
                return Ok(());
            }
            agent.shutdown_requested = true;
            (process, Arc::clone(&agent.log))
        };

        let payload = serde_json::json!({
            "type": "control_request",
            "request_id": uuid::Uuid::new_v4().to_string(),
            "request": { "subtype": "interrupt" },
        })
        .to_string();
        write_to(&process, &log, name, &payload).await?;
        process.close_stdin().await;
        log::info!("Requested shutdown of agent {}/{}", session_id, name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Attach an observer to a session, optionally filtered to one agent.
    pub fn attach(
        &self,
        session_id: &SessionId,
        agent: Option<&str>,
    ) -> Result<Observer, CoreError> {
        let mut inner = self.lock();
        let Inner { registry, bridge } = &mut *inner;
        Ok(bridge.attach(registry, session_id, agent)?)
    }

    pub fn detach(&self, handle: &ObserverHandle) -> bool {
        self.lock().bridge.detach(handle)
    }

    pub fn observer_count(&self, session_id: &SessionId) -> usize {
        self.lock().bridge.observer_count(session_id)
    }
}

async fn write_to(
    process: &AgentProcess,
    log: &LogHandle,
    name: &str,
    payload: &str,
) -> Result<(), CoreError> {
    log_line(log, "STDIN", payload);
    process
        .send(payload)
        .await
        .map_err(|e| CoreError::from_send(name, e))
}

async fn wait_settled(mut settled: watch::Receiver<bool>, bound: Duration) {
    if tokio::time::timeout(bound, settled.wait_for(|done| *done))
        .await
        .is_err()
    {
        log::warn!("Agent events not settled within {:?}", bound);
    }
}

/// Apply one process instance's events until it exits.
async fn pump(
    inner: Arc<Mutex<Inner>>,
    session_id: SessionId,
    name: String,
    instance: u64,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    log: LogHandle,
    settled: watch::Sender<bool>,
) {
    let mut decoder = StreamDecoder::new();
    let stdout_line = |line: &[u8]| log_line(&log, "STDOUT", &String::from_utf8_lossy(line));
    let mut exit = None;

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Stdout(chunk) => {
                let decoded = decoder.feed_with(&chunk, stdout_line);
                apply(&inner, &session_id, &name, instance, decoded);
            }
            ProcessEvent::Stderr(line) => {
                log::warn!("Agent {}/{} stderr: {}", session_id, name, line);
                log_line(&log, "STDERR", &line);
            }
            ProcessEvent::Exit(status) => {
                exit = Some(status);
                break;
            }
        }
    }

    let decoded = decoder.finish_with(stdout_line);
    apply(&inner, &session_id, &name, instance, decoded);

    let exit = exit.unwrap_or_else(|| AgentExit::unknown(false));
    log_line(
        &log,
        "EXIT",
        &serde_json::to_string(&exit).unwrap_or_else(|_| format!("{:?}", exit)),
    );
    {
        let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_current(&session_id, &name, instance) {
            guard.apply_exit(&session_id, &name, exit);
        }
    }
    let _ = settled.send(true);
}

fn apply(
    inner: &Mutex<Inner>,
    session_id: &SessionId,
    name: &str,
    instance: u64,
    events: Vec<AgentEvent>,
) {
    if events.is_empty() {
        return;
    }
    let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if !guard.is_current(session_id, name, instance) {
        log::debug!(
            "Discarding {} events from superseded instance {} of {}/{}",
            events.len(),
            instance,
            session_id,
            name
        );
        return;
    }
    for event in events {
        guard.apply_agent_event(session_id, name, event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
