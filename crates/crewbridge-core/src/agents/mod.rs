//! Agent launch configuration and protocol decoding.
//!
//! Agents speak the CLI's stream-json protocol: newline-delimited JSON
//! records on stdout, control messages on stdin.

pub mod config;
mod decoder;
pub mod event;
mod types;

pub use config::AgentConfig;
pub use decoder::StreamDecoder;
pub use event::AgentEvent;
