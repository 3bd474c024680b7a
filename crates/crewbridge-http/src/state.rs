//! Shared state for the HTTP server.

use std::sync::Arc;

use crewbridge_core::Controller;

/// Shared state available to all HTTP handlers.
#[derive(Clone)]
pub struct SharedState {
    pub controller: Arc<Controller>,
}

impl SharedState {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}
