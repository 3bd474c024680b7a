//! Command building for agent processes.
//!
//! Agents normally run directly: the binary is resolved against `PATH` up
//! front so a missing binary is reported as a spawn error instead of a
//! process that dies immediately. When a shell prefix is configured (e.g.
//! `/bin/zsh -l -c`) the command is wrapped in that shell to pick up the
//! user's login environment, and resolution is left to the shell.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::spawn::SpawnError;

/// Exit status emitted when an agent process terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Termination was requested through `kill`.
    pub requested: bool,
}

impl AgentExit {
    pub fn from_status(status: ExitStatus, requested: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            requested,
        }
    }

    /// Exit whose status could not be collected.
    pub fn unknown(requested: bool) -> Self {
        Self {
            code: None,
            signal: None,
            requested,
        }
    }

    /// The process ended on its own with status 0.
    pub fn is_clean(&self) -> bool {
        !self.requested && self.code == Some(0)
    }
}

/// Prepend the binary's parent directory to PATH so node/etc. are found.
pub fn prepare_path_env(cmd: &mut Command, binary_path: &str) {
    if binary_path.contains('/') {
        if let Some(dir) = Path::new(binary_path).parent() {
            if let Some(dir_str) = dir.to_str() {
                let existing = std::env::var("PATH").unwrap_or_default();
                let combined = if existing.is_empty() {
                    dir_str.to_string()
                } else {
                    format!("{}:{}", dir_str, existing)
                };
                cmd.env("PATH", combined);
            }
        }
    }
}

/// Resolve a binary name or path to an executable file.
///
/// A relative path such as `./agent.sh` is taken relative to `working_dir`,
/// where the agent will run, not to the daemon's own directory.
pub fn resolve_binary(binary: &str, working_dir: Option<&Path>) -> Option<PathBuf> {
    resolve_in(binary, std::env::var_os("PATH").as_deref(), working_dir)
}

fn resolve_in(binary: &str, path_var: Option<&OsStr>, base: Option<&Path>) -> Option<PathBuf> {
    if binary.is_empty() {
        return None;
    }
    if binary.contains('/') {
        let path = match base {
            Some(base) if Path::new(binary).is_relative() => base.join(binary),
            _ => PathBuf::from(binary),
        };
        return is_executable(&path).then_some(path);
    }
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Build the command for an agent binary.
///
/// # Arguments
/// * `binary_path` - Name or path of the executable
/// * `args` - Arguments to pass to the executable
/// * `working_dir` - Optional working directory (must exist)
/// * `shell_prefix` - Optional shell wrapper (e.g. "/bin/zsh -l -c")
///
/// # Returns
/// A configured Command ready for further customization (env, stdio)
pub fn build_agent_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, SpawnError> {
    if let Some(dir) = working_dir {
        if !Path::new(dir).is_dir() {
            return Err(SpawnError::InvalidWorkingDir(dir.to_string()));
        }
    }

    let (mut cmd, program) = match shell_prefix.filter(|p| !p.trim().is_empty()) {
        Some(prefix) => (wrap_in_shell(prefix, binary_path, args)?, binary_path.to_string()),
        None => {
            let resolved = resolve_binary(binary_path, working_dir.map(Path::new))
                .ok_or_else(|| SpawnError::BinaryNotFound(binary_path.to_string()))?;
            let mut cmd = Command::new(&resolved);
            cmd.args(args);
            (cmd, resolved.to_string_lossy().into_owned())
        }
    };

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    prepare_path_env(&mut cmd, &program);

    Ok(cmd)
}

/// Wrap the command as `<prefix> '<quoted_command>'`.
fn wrap_in_shell(prefix: &str, binary_path: &str, args: &[String]) -> Result<Command, SpawnError> {
    let prefix_parts: Vec<&str> = prefix.split_whitespace().collect();
    let (shell_program, shell_args) = prefix_parts
        .split_first()
        .ok_or_else(|| SpawnError::InvalidCommand("Empty shell prefix".to_string()))?;

    let mut command_parts = Vec::with_capacity(args.len() + 1);
    for part in std::iter::once(binary_path).chain(args.iter().map(String::as_str)) {
        command_parts.push(
            shlex::try_quote(part)
                .map_err(|_| SpawnError::InvalidCommand(format!("Invalid argument: {}", part)))?
                .into_owned(),
        );
    }

    let mut cmd = Command::new(shell_program);
    cmd.args(shell_args).arg(command_parts.join(" "));
    Ok(cmd)
}

// ============================================================================
// TESTS
// ============================================================================
