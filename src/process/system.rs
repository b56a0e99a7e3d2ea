//! Real subprocesses via `tokio::process`.
//!
//! Every child is placed in its own process group so that a timeout can
//! take down anything it backgrounded (`kill(-pgid, SIGKILL)`).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{CommandOutput, CommandSpec, ExitInfo, ManagedProcess, ProcessLauncher, ProcessState};
use crate::{Error, Result};

/// How long to wait for a SIGKILLed child to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to keep draining pipes after a timed-out command was killed.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches real OS processes.
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd
    }
}

fn spawn_error(spec: &CommandSpec, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::CommandNotFound(spec.program.clone())
    } else {
        Error::Process(format!("failed to spawn '{}': {}", spec.program, e))
    }
}

#[async_trait::async_trait]
impl ProcessLauncher for SystemLauncher {
    fn resolve(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        let mut cmd = Self::command(spec);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| spawn_error(spec, e))?;
        debug!(command = %spec, pid = ?child.id(), "spawned process");

        Ok(Box::new(SystemProcess {
            name: spec.program_name().to_string(),
            child,
        }))
    }

    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = Self::command(spec);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_error(spec, e))?;
        let pid = child.id();
        debug!(command = %spec, pid = ?pid, timeout = ?timeout, "running command");

        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let (exit, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (Some(ExitInfo::from(status?)), false),
            Err(_) => {
                warn!(command = %spec, pid = ?pid, timeout = ?timeout, "command timed out, killing process group");
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.start_kill();
                let exit = tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait())
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .map(ExitInfo::from);
                (exit, true)
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        Ok(CommandOutput {
            exit_code: exit.and_then(|e| e.code),
            stdout,
            stderr,
            timed_out,
        })
    }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

async fn collect(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

/// SIGKILL an entire process group (negative pid).
fn kill_process_group(pgid: u32) {
    unsafe {
        libc::kill(-(pgid as i32), libc::SIGKILL);
    }
}

/// Deliver a signal to a single pid. A vanished process is not an error.
fn send_signal(pid: u32, signal: i32) -> Result<()> {
    let rc = unsafe { libc::kill(pid as i32, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(Error::Process(format!(
        "failed to send signal {} to pid {}: {}",
        signal, pid, err
    )))
}

/// A spawned long-lived child.
struct SystemProcess {
    name: String,
    child: Child,
}

#[async_trait::async_trait]
impl ManagedProcess for SystemProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn try_status(&mut self) -> Result<ProcessState> {
        match self.child.try_wait()? {
            None => Ok(ProcessState::Running),
            Some(status) => Ok(ProcessState::Exited(status.into())),
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }
        let Some(pid) = self.child.id() else {
            let status = self.child.wait().await?;
            return Ok(status.into());
        };

        send_signal(pid, libc::SIGTERM)?;
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            return Ok(status?.into());
        }

        warn!(process = %self.name, pid, grace = ?grace, "process ignored SIGTERM, sending SIGKILL");
        self.child.start_kill()?;
        match tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
            Ok(status) => Ok(status?.into()),
            Err(_) => Err(Error::TimedOut(format!(
                "{} (pid {}) did not exit after SIGKILL",
                self.name, pid
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() {
        let launcher = SystemLauncher::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = launcher.run(&spec, Duration::from_secs(10)).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_run_timeout_kills_group() {
        let launcher = SystemLauncher::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo started; sleep 30 & sleep 30"]);
        let started = std::time::Instant::now();
        let out = launcher.run(&spec, Duration::from_millis(300)).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(out.stdout.trim(), "started");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let launcher = SystemLauncher::new();
        let spec = CommandSpec::new("definitely-not-a-real-binary-4f1c");
        assert!(launcher.resolve(&spec.program).is_none());
        let err = launcher.spawn(&spec).await.err().unwrap();
        assert!(matches!(err, Error::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn test_terminate_escalates() {
        let launcher = SystemLauncher::new();
        let spec = CommandSpec::new("sh").args(["-c", "trap '' TERM; sleep 30"]);
        let mut process = launcher.spawn(&spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(process.is_alive());

        let exit = process.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert!(!process.is_alive());
    }
}
