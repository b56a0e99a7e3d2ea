//! Process control primitives
//!
//! Managers never touch `tokio::process` directly. They go through the
//! [`ProcessLauncher`] trait so the same lifecycle code drives real
//! subprocesses ([`SystemLauncher`]) and recorded fakes ([`MockLauncher`]).
//!
//! Two shapes of child are supported:
//! - long-lived servers via [`ProcessLauncher::spawn`], returned as a
//!   [`ManagedProcess`] that the caller exclusively owns;
//! - bounded one-shot commands via [`ProcessLauncher::run`], which always
//!   terminate (with their whole process group) once the timeout passes.

pub mod mock;
pub mod system;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use mock::MockLauncher;
pub use system::SystemLauncher;

use crate::Result;

/// Description of a command to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Final path component of the program, used as a component label.
    pub fn program_name(&self) -> &str {
        program_name(&self.program)
    }

    /// Look up an environment override on this spec.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

pub(crate) fn program_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Liveness snapshot of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(ExitInfo),
}

/// Captured result of a bounded one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// A long-lived child owned by exactly one manager.
#[async_trait::async_trait]
pub trait ManagedProcess: Send + Sync {
    /// OS process id, if the process has not been reaped.
    fn pid(&self) -> Option<u32>;

    /// Label used in logs (program name).
    fn name(&self) -> &str;

    /// Non-blocking liveness check.
    fn try_status(&mut self) -> Result<ProcessState>;

    fn is_alive(&mut self) -> bool {
        matches!(self.try_status(), Ok(ProcessState::Running))
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo>;
}

/// Spawns and runs subprocesses on behalf of the managers.
#[async_trait::async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Resolve a program against `PATH` (or check an explicit path).
    fn resolve(&self, program: &str) -> Option<PathBuf>;

    /// Start a long-lived process.
    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>>;

    /// Run a command to completion, killing its process group on timeout.
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput>;
}

/// Stop a process, logging rather than propagating failures.
///
/// Returns `true` when the process is known to be gone.
pub async fn stop_quietly(process: &mut Box<dyn ManagedProcess>, grace: Duration) -> bool {
    let name = process.name().to_string();
    let pid = process.pid();
    match process.terminate(grace).await {
        Ok(exit) => {
            tracing::info!(process = %name, pid = ?pid, %exit, "process stopped");
            true
        }
        Err(e) => {
            tracing::warn!(process = %name, pid = ?pid, error = %e, "failed to stop process");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("/opt/noVNC/utils/novnc_proxy")
            .args(["--vnc", "localhost:5901"])
            .arg("--listen")
            .arg("6080")
            .env("DISPLAY", ":0")
            .env("DISPLAY", ":1")
            .cwd("/workspace");
        assert_eq!(spec.program_name(), "novnc_proxy");
        assert_eq!(spec.env_value("DISPLAY"), Some(":1"));
        assert_eq!(spec.env.len(), 1);
        assert_eq!(
            spec.to_string(),
            "/opt/noVNC/utils/novnc_proxy --vnc localhost:5901 --listen 6080"
        );
    }

    #[test]
    fn test_command_output_combined() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "added 1 package\n".into(),
            stderr: "npm WARN deprecated".into(),
            timed_out: false,
        };
        assert!(!out.success());
        assert_eq!(out.combined(), "added 1 package\nnpm WARN deprecated");
    }

    #[test]
    fn test_exit_info_display() {
        assert_eq!(ExitInfo::code(0).to_string(), "exit code 0");
        assert_eq!(ExitInfo::signal(9).to_string(), "killed by signal 9");
        assert!(ExitInfo::code(0).success());
        assert!(!ExitInfo::signal(15).success());
    }
}
