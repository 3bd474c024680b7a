//! Agent launch configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::spawn::SpawnConfig;

const DEFAULT_BINARY: &str = "claude";
const DEFAULT_PERMISSION_MODE: &str = "default";

fn default_binary() -> String {
    DEFAULT_BINARY.to_string()
}

/// How to launch one agent. Stored on the agent record so that a relaunch
/// reproduces the original process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_binary")]
    pub binary_path: String,

    /// Extra arguments appended after the protocol arguments.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub permission_mode: Option<String>,

    /// Explicit environment; wins over the bundle.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Slug of the environment bundle to merge in.
    #[serde(default)]
    pub env_bundle: Option<String>,

    #[serde(default)]
    pub shell_prefix: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary(),
            args: Vec::new(),
            model: None,
            permission_mode: None,
            env: BTreeMap::new(),
            env_bundle: None,
            shell_prefix: None,
        }
    }
}

impl AgentConfig {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            ..Self::default()
        }
    }

    /// Protocol arguments for a stream-json session.
    pub fn protocol_args(&self, resume: Option<&str>) -> Vec<String> {
        let mode = self
            .permission_mode
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_PERMISSION_MODE);
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--permission-prompt-tool",
            "stdio",
            "--permission-mode",
            mode,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(model) = self.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        if let Some(id) = resume.filter(|id| !id.is_empty()) {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }

        args.extend(self.args.iter().cloned());
        args
    }

    /// Build the supervisor configuration.
    ///
    /// `env` is the already-merged environment (bundle then overrides).
    pub fn build(
        &self,
        working_dir: &str,
        env: BTreeMap<String, String>,
        resume: Option<&str>,
        send_timeout: Duration,
        kill_escalation: Duration,
    ) -> SpawnConfig {
        let mut config = SpawnConfig::new(&self.binary_path, self.protocol_args(resume))
            .working_dir(working_dir)
            .envs(env)
            .timeouts(send_timeout, kill_escalation);

        if let Some(ref shell) = self.shell_prefix {
            config = config.shell_prefix(shell);
        }

        config
    }
}
