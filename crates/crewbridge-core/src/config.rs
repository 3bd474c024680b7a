//! Controller configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default cap on buffered messages per agent.
pub const DEFAULT_MAX_MESSAGES: usize = 500;

/// Default per-observer channel capacity (beyond the replay snapshot).
pub const DEFAULT_OBSERVER_CAPACITY: usize = 256;

/// What to do when an agent references an environment bundle that cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundlePolicy {
    /// Fail the spawn with the lookup error.
    #[default]
    Abort,
    /// Log a warning and spawn without the bundle.
    Proceed,
}

/// Tunables for a [`crate::Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Messages kept per agent; older ones are trimmed first.
    pub max_messages_per_agent: usize,
    /// Live events an observer may fall behind before it is dropped.
    pub observer_capacity: usize,
    /// Time a process gets to exit after SIGTERM before it is killed.
    pub kill_grace: Duration,
    /// Upper bound for forced termination to be confirmed.
    pub kill_escalation: Duration,
    /// Upper bound for a single stdin write.
    pub send_timeout: Duration,
    /// Directory for per-agent transcript logs (disabled when `None`).
    pub log_dir: Option<PathBuf>,
    /// Environment-bundle failure handling.
    pub bundle_policy: BundlePolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_messages_per_agent: DEFAULT_MAX_MESSAGES,
            observer_capacity: DEFAULT_OBSERVER_CAPACITY,
            kill_grace: Duration::from_secs(3),
            kill_escalation: Duration::from_secs(2),
            send_timeout: Duration::from_secs(5),
            log_dir: None,
            bundle_policy: BundlePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.max_messages_per_agent, 500);
        assert_eq!(config.kill_grace, Duration::from_secs(3));
        assert_eq!(config.bundle_policy, BundlePolicy::Abort);
        assert!(config.log_dir.is_none());
    }
}
