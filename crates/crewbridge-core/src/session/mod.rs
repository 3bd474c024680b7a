//! Sessions, agents and their in-memory registry.
//!
//! A session groups named agents working in one directory. The [`Registry`]
//! owns every session record; callers refer to sessions by [`SessionId`] and
//! to agents by name.

mod registry;
mod state;

pub use registry::{Registry, RegistryError, Transition};
pub use state::{
    Agent, AgentDescriptor, AgentState, ApprovalKind, ConnectionStatus, Message, PendingApproval,
    Resolution, Sender, Session, SessionDescriptor, SessionId, SessionStatus, TaskItem, TaskStatus,
};
