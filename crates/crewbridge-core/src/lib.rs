//! # crewbridge-core
//!
//! Core orchestration for Crewbridge: supervises command-line agent
//! processes and bridges their event streams to live observers.
//!
//! This crate is transport-agnostic and can be used by:
//! - The HTTP/WebSocket adapter (`crewbridge-http`)
//! - The standalone daemon (`crewbridge-daemon`)
//! - Tests driving the [`Controller`] directly
//!
//! ## Key Concepts
//!
//! - **Session**: A unit owning one or more named agents
//! - **Agent**: One supervised process plus its conversational state
//! - **AgentEvent**: Typed event decoded from an agent's stream-json output
//! - **BridgeEvent**: Payload delivered to observers
//! - **Observer**: A live subscriber receiving replay-then-stream of a session

pub mod agents;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod env_bundle;
pub mod error;
pub mod logging;
pub mod session;
pub mod shell;
pub mod spawn;

// Re-export commonly used types
pub use agents::{AgentConfig, AgentEvent, StreamDecoder};
pub use bridge::{BridgeEvent, EventBridge, Observer, ObserverHandle};
pub use config::{BundlePolicy, ControllerConfig};
pub use controller::{ApprovalOutcome, Controller};
pub use env_bundle::{EnvBundleStore, InMemoryEnvBundles, NoEnvBundles};
pub use error::{CoreError, ErrorKind};
pub use session::{AgentState, Registry, SessionId};
