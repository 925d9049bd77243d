//! Child process abstraction
//!
//! Resource scripts, notification scripts and fencing commands are all run
//! as children of the engine. Spawning is synchronous so a failure to start
//! can be handled on the spot. Completion arrives later as a [`ChildExit`]
//! through the channel handed to the spawner.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{FailoverError, FailoverResult};

/// Engine-assigned identity of a spawned child
///
/// OS pids can be reused, so completion is always matched on this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessHandle(pub u64);

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A command ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Run `script` through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").with_arg("-c").with_arg(script)
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env_var<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Rendered command line for logs
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How a child finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(sig) => write!(f, "killed by signal {}", sig),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return ExitStatus::Signaled(sig);
            }
        }
        ExitStatus::Exited(-1)
    }
}

/// Completion report for a spawned child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub handle: ProcessHandle,
    pub status: ExitStatus,
}

/// Starts child processes on behalf of the engine
pub trait ProcessSpawner: Send + Sync {
    /// Start `cmd`; returns the OS pid. The exit must later be reported as a
    /// [`ChildExit`] carrying `handle`.
    fn spawn(&self, handle: ProcessHandle, cmd: &CommandSpec) -> FailoverResult<u32>;
}

/// Production spawner backed by `tokio::process`
///
/// Each child runs in its own process group and is reaped by a small task
/// that forwards the exit status. Must be used from within a tokio runtime.
pub struct TokioProcessSpawner {
    exits: mpsc::UnboundedSender<ChildExit>,
}

impl TokioProcessSpawner {
    pub fn new(exits: mpsc::UnboundedSender<ChildExit>) -> Self {
        Self { exits }
    }
}

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(&self, handle: ProcessHandle, cmd: &CommandSpec) -> FailoverResult<u32> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| FailoverError::spawn(cmd.display(), e))?;
        let pid = child.id().unwrap_or_default();
        debug!(%handle, pid, command = %cmd.display(), "Spawned child process");

        let exits = self.exits.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!(%handle, pid, error = %e, "Failed to wait for child process");
                    ExitStatus::Exited(-1)
                }
            };
            if exits.send(ChildExit { handle, status }).is_err() {
                debug!(%handle, "Exit receiver gone, dropping child exit");
            }
        });

        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let cmd = CommandSpec::new("/usr/bin/fence")
            .with_args(["--host", "bmc"])
            .with_arg("reset")
            .with_env_var("HA_NODE", "beta");

        assert_eq!(cmd.display(), "/usr/bin/fence --host bmc reset");
        assert_eq!(cmd.env.get("HA_NODE").map(String::as_str), Some("beta"));
    }

    #[test]
    fn test_exit_status_success() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(100).success());
        assert!(!ExitStatus::Signaled(9).success());
        assert_eq!(ExitStatus::Signaled(9).code(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_spawner_reports_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawner = TokioProcessSpawner::new(tx);

        let pid = spawner
            .spawn(ProcessHandle(7), &CommandSpec::shell("exit 3"))
            .unwrap();
        assert!(pid > 0);

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.handle, ProcessHandle(7));
        assert_eq!(exit.status, ExitStatus::Exited(3));
    }

    #[tokio::test]
    async fn test_tokio_spawner_reports_spawn_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spawner = TokioProcessSpawner::new(tx);

        let result = spawner.spawn(
            ProcessHandle(1),
            &CommandSpec::new("/nonexistent/definitely-not-here"),
        );
        assert!(result.is_err());
    }
}
