//! Event bridge - fan-out of session events to live observers.
//!
//! Each observer gets its own bounded channel. On attach the observer first
//! receives a replay of the session's current state, then every event
//! broadcast afterwards. The bridge is driven under the same lock as the
//! [`Registry`], so an event is either part of an observer's replay or
//! delivered live to it, never both and never neither.
//!
//! # Example
//!
//! ```rust
//! use crewbridge_core::bridge::{BridgeEvent, EventBridge};
//! use crewbridge_core::session::Registry;
//!
//! let mut registry = Registry::default();
//! let session_id = registry.create("review", "/tmp");
//!
//! let mut bridge = EventBridge::new(16);
//! let mut observer = bridge.attach(&registry, &session_id, None).unwrap();
//! assert!(matches!(observer.try_recv(), Some(BridgeEvent::ReplayComplete)));
//!
//! bridge.broadcast(&session_id, BridgeEvent::ProcessError {
//!     agent: "reviewer".to_string(),
//!     message: "rate limited".to_string(),
//! });
//! assert!(matches!(observer.try_recv(), Some(BridgeEvent::ProcessError { .. })));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::{
    AgentDescriptor, AgentState, ApprovalKind, Message, PendingApproval, Registry, RegistryError,
    Resolution, SessionId, TaskItem,
};

/// Payload delivered to observers, shaped `{"type": ..., "agent": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Current descriptor of an agent (replay, spawn and relaunch).
    AgentSnapshot {
        agent: String,
        descriptor: AgentDescriptor,
    },

    /// A complete message from the user, the agent or the system.
    Message { agent: String, message: Message },

    TextDelta { agent: String, text: String },

    PermissionRequest {
        agent: String,
        request: PendingApproval,
    },

    PlanRequest {
        agent: String,
        request: PendingApproval,
    },

    /// A pending approval left the pending set.
    ApprovalResolved {
        agent: String,
        request_id: String,
        resolution: Resolution,
    },

    TaskUpdate { agent: String, tasks: Vec<TaskItem> },

    StateChange {
        agent: String,
        state: AgentState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<AgentState>,
    },

    ProcessError { agent: String, message: String },

    ProtocolError {
        agent: String,
        raw: String,
        error: String,
    },

    /// End of the replay; everything after this is live.
    ReplayComplete,

    /// The session was removed; no further events follow.
    SessionClosed,
}

impl BridgeEvent {
    /// Agent the event belongs to; `None` for session-wide events.
    pub fn agent(&self) -> Option<&str> {
        match self {
            BridgeEvent::AgentSnapshot { agent, .. }
            | BridgeEvent::Message { agent, .. }
            | BridgeEvent::TextDelta { agent, .. }
            | BridgeEvent::PermissionRequest { agent, .. }
            | BridgeEvent::PlanRequest { agent, .. }
            | BridgeEvent::ApprovalResolved { agent, .. }
            | BridgeEvent::TaskUpdate { agent, .. }
            | BridgeEvent::StateChange { agent, .. }
            | BridgeEvent::ProcessError { agent, .. }
            | BridgeEvent::ProtocolError { agent, .. } => Some(agent),
            BridgeEvent::ReplayComplete | BridgeEvent::SessionClosed => None,
        }
    }

    /// The live event announcing a pending approval.
    pub fn for_approval(approval: PendingApproval) -> Self {
        let agent = approval.agent.clone();
        match approval.kind {
            ApprovalKind::Permission => BridgeEvent::PermissionRequest {
                agent,
                request: approval,
            },
            ApprovalKind::Plan => BridgeEvent::PlanRequest {
                agent,
                request: approval,
            },
        }
    }
}

/// Identifies an attached observer for [`EventBridge::detach`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    pub id: u64,
    pub session_id: SessionId,
}

/// A live subscriber to one session (optionally one agent).
#[derive(Debug)]
pub struct Observer {
    handle: ObserverHandle,
    rx: mpsc::Receiver<BridgeEvent>,
}

impl Observer {
    /// Next event; `None` once the observer has been detached or dropped
    /// by the bridge.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }

    pub fn handle(&self) -> &ObserverHandle {
        &self.handle
    }

    pub fn session_id(&self) -> &SessionId {
        &self.handle.session_id
    }
}

struct Subscriber {
    id: u64,
    agent: Option<String>,
    tx: mpsc::Sender<BridgeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &BridgeEvent) -> bool {
        match (&self.agent, event.agent()) {
            (Some(filter), Some(agent)) => filter == agent,
            _ => true,
        }
    }
}

/// Per-session observer sets.
pub struct EventBridge {
    observers: HashMap<SessionId, Vec<Subscriber>>,
    next_id: u64,
    capacity: usize,
}

impl EventBridge {
    /// Create a bridge whose observers may fall `capacity` live events behind.
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: HashMap::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    /// Attach an observer and queue its replay.
    ///
    /// Fails if the session (or the filtered agent) does not exist.
    pub fn attach(
        &mut self,
        registry: &Registry,
        session_id: &SessionId,
        agent: Option<&str>,
    ) -> Result<Observer, RegistryError> {
        if let Some(name) = agent {
            registry.agent(session_id, name)?;
        }
        let replay = replay(registry, session_id, agent)?;

        let (tx, rx) = mpsc::channel(self.capacity + replay.len());
        for event in replay {
            // The channel was sized for the replay.
            let _ = tx.try_send(event);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.observers
            .entry(session_id.clone())
            .or_default()
            .push(Subscriber {
                id,
                agent: agent.map(str::to_owned),
                tx,
            });
        log::debug!("Observer {} attached to session {}", id, session_id);

        Ok(Observer {
            handle: ObserverHandle {
                id,
                session_id: session_id.clone(),
            },
            rx,
        })
    }

    /// Drop an observer. Returns `false` if it was already gone.
    pub fn detach(&mut self, handle: &ObserverHandle) -> bool {
        let Some(subscribers) = self.observers.get_mut(&handle.session_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.observers.remove(&handle.session_id);
        }
        if removed {
            log::debug!("Observer {} detached from session {}", handle.id, handle.session_id);
        }
        removed
    }

    /// Deliver an event to every observer of the session.
    ///
    /// An observer whose channel is full or closed is dropped; the others
    /// are unaffected. Returns the number of observers that got the event.
    pub fn broadcast(&mut self, session_id: &SessionId, event: BridgeEvent) -> usize {
        let Some(subscribers) = self.observers.get(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for subscriber in subscribers.iter().filter(|s| s.wants(&event)) {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "Observer {} of session {} fell behind, dropping it",
                        subscriber.id,
                        session_id
                    );
                    failed.push(subscriber.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => failed.push(subscriber.id),
            }
        }

        if !failed.is_empty() {
            if let Some(subscribers) = self.observers.get_mut(session_id) {
                subscribers.retain(|s| !failed.contains(&s.id));
                if subscribers.is_empty() {
                    self.observers.remove(session_id);
                }
            }
        }

        delivered
    }

    /// Notify and disconnect every observer of the session.
    pub fn close_session(&mut self, session_id: &SessionId) {
        if let Some(subscribers) = self.observers.remove(session_id) {
            for subscriber in subscribers {
                let _ = subscriber.tx.try_send(BridgeEvent::SessionClosed);
            }
        }
    }

    pub fn observer_count(&self, session_id: &SessionId) -> usize {
        self.observers.get(session_id).map_or(0, Vec::len)
    }
}

/// Snapshot of a session as a sequence of events.
///
/// Agent descriptors first, then each agent's history and in-progress text,
/// then the pending approvals, then [`BridgeEvent::ReplayComplete`].
fn replay(
    registry: &Registry,
    session_id: &SessionId,
    agent: Option<&str>,
) -> Result<Vec<BridgeEvent>, RegistryError> {
    let session = registry.get(session_id)?;
    let descriptors: Vec<AgentDescriptor> = session
        .descriptor()
        .agents
        .into_iter()
        .filter(|d| agent.map_or(true, |name| d.name == name))
        .collect();

    let mut events = Vec::new();
    for descriptor in &descriptors {
        events.push(BridgeEvent::AgentSnapshot {
            agent: descriptor.name.clone(),
            descriptor: descriptor.clone(),
        });
    }

    for descriptor in &descriptors {
        let Some(record) = session.agents.get(&descriptor.name) else {
            continue;
        };
        events.extend(record.messages.iter().map(|message| BridgeEvent::Message {
            agent: record.name.clone(),
            message: message.clone(),
        }));
        if !record.streaming.is_empty() {
            events.push(BridgeEvent::TextDelta {
                agent: record.name.clone(),
                text: record.streaming.clone(),
            });
        }
    }

    events.extend(
        registry
            .pending_approvals(session_id, agent)?
            .into_iter()
            .map(BridgeEvent::for_approval),
    );
    events.push(BridgeEvent::ReplayComplete);
    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentConfig;
    use crate::session::{Agent, Sender};

    fn setup() -> (Registry, SessionId, EventBridge) {
        let mut registry = Registry::default();
        let id = registry.create("review", "/tmp");
        for (i, name) in ["reviewer", "coder"].into_iter().enumerate() {
            let mut agent = Agent::new(name, AgentConfig::default(), i as u64);
            agent.created_at = chrono::Utc::now() + chrono::Duration::milliseconds(i as i64);
            registry.insert_agent(&id, agent).unwrap();
        }
        (registry, id, EventBridge::new(4))
    }

    fn drain(observer: &mut Observer) -> Vec<BridgeEvent> {
        std::iter::from_fn(|| observer.try_recv()).collect()
    }

    fn delta(agent: &str, text: &str) -> BridgeEvent {
        BridgeEvent::TextDelta {
            agent: agent.to_string(),
            text: text.to_string(),
        }
    }

    mod bridge_event {
        use super::*;

        #[test]
        fn serializes_with_type_and_agent() {
            let json = serde_json::to_value(delta("reviewer", "Hi")).unwrap();
            assert_eq!(json["type"], "text_delta");
            assert_eq!(json["agent"], "reviewer");
            assert_eq!(json["text"], "Hi");

            let json = serde_json::to_value(BridgeEvent::ReplayComplete).unwrap();
            assert_eq!(json, serde_json::json!({"type": "replay_complete"}));
        }

        #[test]
        fn approval_kind_selects_variant() {
            let plan = PendingApproval::plan("planner", "p-1".to_string(), "plan".to_string());
            assert!(matches!(BridgeEvent::for_approval(plan), BridgeEvent::PlanRequest { .. }));
        }
    }

    mod replay {
        use super::*;

        #[test]
        fn replays_state_in_order() {
            let (mut registry, id, mut bridge) = setup();
            registry
                .append_message(&id, "reviewer", Message::new(Sender::User, "hello"))
                .unwrap();
            registry.push_streaming(&id, "reviewer", "Wor").unwrap();
            registry
                .add_pending_approval(
                    &id,
                    PendingApproval::permission(
                        "coder",
                        "req-1".to_string(),
                        "Bash".to_string(),
                        serde_json::json!({}),
                    ),
                )
                .unwrap();

            let mut observer = bridge.attach(&registry, &id, None).unwrap();
            let events = drain(&mut observer);

            assert_eq!(events.len(), 6);
            assert!(matches!(&events[0], BridgeEvent::AgentSnapshot { agent, .. } if agent == "reviewer"));
            assert!(matches!(&events[1], BridgeEvent::AgentSnapshot { agent, .. } if agent == "coder"));
            assert!(matches!(&events[2], BridgeEvent::Message { message, .. } if message.text == "hello"));
            assert_eq!(events[3], delta("reviewer", "Wor"));
            assert!(matches!(&events[4], BridgeEvent::PermissionRequest { request, .. } if request.request_id == "req-1"));
            assert_eq!(events[5], BridgeEvent::ReplayComplete);
        }

        #[test]
        fn agent_filter_limits_replay() {
            let (registry, id, mut bridge) = setup();
            let mut observer = bridge.attach(&registry, &id, Some("coder")).unwrap();
            let events = drain(&mut observer);
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].agent(), Some("coder"));
        }

        #[test]
        fn unknown_session_or_agent_fails() {
            let (registry, id, mut bridge) = setup();
            assert!(bridge.attach(&registry, &SessionId::from("nope"), None).is_err());
            assert!(bridge.attach(&registry, &id, Some("ghost")).is_err());
            assert_eq!(bridge.observer_count(&id), 0);
        }
    }

    mod live {
        use super::*;

        #[test]
        fn broadcast_reaches_filtered_observers() {
            let (registry, id, mut bridge) = setup();
            let mut all = bridge.attach(&registry, &id, None).unwrap();
            let mut coder_only = bridge.attach(&registry, &id, Some("coder")).unwrap();
            drain(&mut all);
            drain(&mut coder_only);

            assert_eq!(bridge.broadcast(&id, delta("reviewer", "a")), 1);
            assert_eq!(bridge.broadcast(&id, delta("coder", "b")), 2);

            assert_eq!(drain(&mut all), vec![delta("reviewer", "a"), delta("coder", "b")]);
            assert_eq!(drain(&mut coder_only), vec![delta("coder", "b")]);
        }

        #[test]
        fn full_observer_is_dropped_alone() {
            let (registry, id, mut bridge) = setup();
            let mut slow = bridge.attach(&registry, &id, None).unwrap();
            let mut fast = bridge.attach(&registry, &id, None).unwrap();
            drain(&mut slow);

            for i in 0..8 {
                bridge.broadcast(&id, delta("reviewer", &i.to_string()));
                drain(&mut fast);
            }

            assert_eq!(bridge.observer_count(&id), 1);
            assert_eq!(bridge.broadcast(&id, delta("reviewer", "x")), 1);
            assert_eq!(drain(&mut fast), vec![delta("reviewer", "x")]);
        }

        #[test]
        fn closed_observer_is_pruned() {
            let (registry, id, mut bridge) = setup();
            let observer = bridge.attach(&registry, &id, None).unwrap();
            drop(observer);

            assert_eq!(bridge.broadcast(&id, delta("reviewer", "a")), 0);
            assert_eq!(bridge.observer_count(&id), 0);
        }

        #[test]
        fn detach_is_idempotent() {
            let (registry, id, mut bridge) = setup();
            let observer = bridge.attach(&registry, &id, None).unwrap();
            assert!(bridge.detach(observer.handle()));
            assert!(!bridge.detach(observer.handle()));
            assert_eq!(bridge.observer_count(&id), 0);
        }

        #[tokio::test]
        async fn close_session_ends_streams() {
            let (registry, id, mut bridge) = setup();
            let mut observer = bridge.attach(&registry, &id, None).unwrap();
            drain(&mut observer);

            bridge.close_session(&id);

            assert_eq!(observer.recv().await, Some(BridgeEvent::SessionClosed));
            assert_eq!(observer.recv().await, None);
        }
    }
}
