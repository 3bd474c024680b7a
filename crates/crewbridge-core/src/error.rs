//! Errors raised at the controller boundary.
//!
//! Each layer has its own `thiserror` enum ([`SpawnError`], [`SendError`],
//! [`RegistryError`], [`EnvBundleError`]); [`CoreError`] unifies them for
//! callers and carries an [`ErrorKind`] so a transport can pick a status code
//! without matching on every variant.

use thiserror::Error;

use crate::env_bundle::EnvBundleError;
use crate::session::{RegistryError, SessionId};
use crate::spawn::{SendError, SpawnError};

/// Coarse error classification for transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was well-formed but not acceptable (400).
    Validation,
    /// A referenced session, agent or bundle does not exist (404).
    NotFound,
    /// A collaborator could not be reached (503).
    Unavailable,
    /// Anything else (500).
    Internal,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Unknown agent '{name}' in session {session_id}")]
    UnknownAgent { session_id: SessionId, name: String },

    #[error("Agent name already active in this session: {0}")]
    DuplicateName(String),

    #[error("Agent is not running: {0}")]
    NotRunning(String),

    #[error("Session is closing: {0}")]
    SessionClosing(SessionId),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    EnvBundle(#[from] EnvBundleError),

    #[error("Failed to write to agent '{name}': {source}")]
    Send {
        name: String,
        #[source]
        source: SendError,
    },
}

impl CoreError {
    /// Classify this error for transport-level status mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::SessionNotFound(_) | CoreError::UnknownAgent { .. } => ErrorKind::NotFound,
            CoreError::DuplicateName(_)
            | CoreError::NotRunning(_)
            | CoreError::SessionClosing(_)
            | CoreError::Invalid(_) => ErrorKind::Validation,
            CoreError::Spawn(SpawnError::Io { .. }) => ErrorKind::Internal,
            CoreError::Spawn(_) => ErrorKind::Validation,
            CoreError::EnvBundle(EnvBundleError::NotFound(_)) => ErrorKind::NotFound,
            CoreError::EnvBundle(EnvBundleError::Unavailable(_)) => ErrorKind::Unavailable,
            CoreError::Send { .. } => ErrorKind::Unavailable,
        }
    }

    /// Map a stdin write failure for `name` onto the caller-facing error.
    pub(crate) fn from_send(name: &str, err: SendError) -> Self {
        match err {
            SendError::NotRunning => CoreError::NotRunning(name.to_string()),
            other => CoreError::Send {
                name: name.to_string(),
                source: other,
            },
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::SessionNotFound(id) => CoreError::SessionNotFound(id),
            RegistryError::UnknownAgent { session_id, name } => {
                CoreError::UnknownAgent { session_id, name }
            }
            RegistryError::DuplicateName(name) => CoreError::DuplicateName(name),
        }
    }
}
