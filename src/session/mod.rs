//! Terminal and desktop session supervision.
//!
//! [`WebTerminalManager`] and [`DesktopManager`] each exclusively own their
//! subprocesses and return typed errors. [`SessionManager`] is the façade
//! request handlers use: it serializes calls per component and turns every
//! outcome into an [`OperationResult`], so nothing raises across the
//! boundary.

pub mod desktop;
pub mod terminal;

pub use desktop::{DesktopManager, DesktopProbe, DesktopStatus};
pub use terminal::{TerminalStatus, WebTerminalManager, WebTerminalStatus};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SandboxConfig;
use crate::process::{CommandSpec, ExitInfo, ManagedProcess, ProcessLauncher, ProcessState};
use crate::{Error, Result};

/// Connect timeout for port probes.
pub(crate) const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of launching one process and waiting out its startup probe.
pub(crate) enum Launched {
    Running(Box<dyn ManagedProcess>),
    Exited(ExitInfo),
}

/// Resolve, spawn, sleep `probe`, then report whether the process survived.
pub(crate) async fn launch(
    launcher: &dyn ProcessLauncher,
    spec: CommandSpec,
    hint: &str,
    probe: Duration,
) -> Result<Launched> {
    let not_found = || Error::BinaryNotFound {
        binary: spec.program_name().to_string(),
        hint: hint.to_string(),
    };
    if launcher.resolve(&spec.program).is_none() {
        return Err(not_found());
    }

    let mut process = match launcher.spawn(&spec).await {
        Ok(p) => p,
        Err(Error::CommandNotFound(_)) => return Err(not_found()),
        Err(e) => return Err(e),
    };
    debug!(command = %spec, pid = ?process.pid(), "launched, probing");

    tokio::time::sleep(probe).await;
    match process.try_status()? {
        ProcessState::Running => Ok(Launched::Running(process)),
        ProcessState::Exited(exit) => {
            warn!(command = %spec, %exit, "process exited during startup probe");
            Ok(Launched::Exited(exit))
        }
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub(crate) async fn port_open(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Outcome of a lifecycle operation on one component.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl OperationResult {
    pub fn ok(component: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            component: component.to_string(),
            message: message.into(),
            error: None,
            pid: None,
            url: None,
        }
    }

    pub fn failed(component: &str, message: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            success: false,
            component: component.to_string(),
            message: message.into(),
            error: Some(error.to_string()),
            pid: None,
            url: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Combined outcome of an `*_all` operation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub success: bool,
    pub terminal: OperationResult,
    pub desktop: OperationResult,
}

impl SessionReport {
    fn new(terminal: OperationResult, desktop: OperationResult) -> Self {
        Self {
            success: terminal.success && desktop.success,
            terminal,
            desktop,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub terminal: TerminalStatus,
    pub desktop: DesktopStatus,
}

const TERMINAL: &str = "terminal";
const DESKTOP: &str = "desktop";

/// Façade over the terminal and desktop managers.
pub struct SessionManager {
    terminal: Mutex<WebTerminalManager>,
    desktop: Mutex<DesktopManager>,
}

impl SessionManager {
    pub fn new(terminal: WebTerminalManager, desktop: DesktopManager) -> Self {
        Self {
            terminal: Mutex::new(terminal),
            desktop: Mutex::new(desktop),
        }
    }

    pub fn from_config(config: &SandboxConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self::new(
            WebTerminalManager::new(
                launcher.clone(),
                config.terminal.clone(),
                config.process.clone(),
                config.workspace_dir.clone(),
            ),
            DesktopManager::new(launcher, config.desktop.clone(), config.process.clone()),
        )
    }

    pub async fn start_terminal(&self) -> OperationResult {
        match self.terminal.lock().await.start().await {
            Ok(status) => OperationResult::ok(TERMINAL, "web terminal started")
                .with_pid(status.pid)
                .with_url(status.url),
            Err(e) => {
                error!(error = %e, "failed to start web terminal");
                OperationResult::failed(TERMINAL, "failed to start web terminal", &e)
            }
        }
    }

    pub async fn stop_terminal(&self) -> OperationResult {
        if self.terminal.lock().await.stop().await {
            OperationResult::ok(TERMINAL, "web terminal stopped")
        } else {
            OperationResult::ok(TERMINAL, "web terminal was not running")
        }
    }

    pub async fn restart_terminal(&self) -> OperationResult {
        match self.terminal.lock().await.restart().await {
            Ok(status) => OperationResult::ok(TERMINAL, "web terminal restarted")
                .with_pid(status.pid)
                .with_url(status.url),
            Err(e) => {
                error!(error = %e, "failed to restart web terminal");
                OperationResult::failed(TERMINAL, "failed to restart web terminal", &e)
            }
        }
    }

    pub async fn start_desktop(&self) -> OperationResult {
        match self.desktop.lock().await.start().await {
            Ok(status) => OperationResult::ok(DESKTOP, "desktop started")
                .with_pid(status.xvfb_pid)
                .with_url(status.url),
            Err(e) => {
                error!(error = %e, "failed to start desktop");
                OperationResult::failed(DESKTOP, "failed to start desktop", &e)
            }
        }
    }

    pub async fn stop_desktop(&self) -> OperationResult {
        if self.desktop.lock().await.stop().await {
            OperationResult::ok(DESKTOP, "desktop stopped")
        } else {
            OperationResult::ok(DESKTOP, "desktop was not running")
        }
    }

    pub async fn restart_desktop(&self) -> OperationResult {
        match self.desktop.lock().await.restart().await {
            Ok(status) => OperationResult::ok(DESKTOP, "desktop restarted")
                .with_pid(status.xvfb_pid)
                .with_url(status.url),
            Err(e) => {
                error!(error = %e, "failed to restart desktop");
                OperationResult::failed(DESKTOP, "failed to restart desktop", &e)
            }
        }
    }

    /// Start both components; one failing does not stop the other.
    pub async fn start_all(&self) -> SessionReport {
        let (terminal, desktop) = tokio::join!(self.start_terminal(), self.start_desktop());
        let report = SessionReport::new(terminal, desktop);
        info!(success = report.success, "start_all finished");
        report
    }

    pub async fn stop_all(&self) -> SessionReport {
        let (terminal, desktop) = tokio::join!(self.stop_terminal(), self.stop_desktop());
        let report = SessionReport::new(terminal, desktop);
        info!("stop_all finished");
        report
    }

    pub async fn restart_all(&self) -> SessionReport {
        self.stop_all().await;
        self.start_all().await
    }

    pub async fn status(&self) -> SessionStatus {
        let terminal = self.terminal.lock().await.status();
        let desktop = self.desktop.lock().await.status();
        SessionStatus { terminal, desktop }
    }

    /// Scoped owner that stops everything when it goes away.
    pub fn guard(self: &Arc<Self>) -> SessionGuard {
        SessionGuard {
            manager: Some(self.clone()),
        }
    }
}

/// Stops all sessions on [`SessionGuard::shutdown`] or, failing that, on drop.
///
/// Dropping only schedules the stop (it cannot be awaited), and only when a
/// tokio runtime is available; prefer `shutdown().await`.
pub struct SessionGuard {
    manager: Option<Arc<SessionManager>>,
}

impl SessionGuard {
    pub fn manager(&self) -> Option<&Arc<SessionManager>> {
        self.manager.as_ref()
    }

    pub async fn shutdown(mut self) -> Option<SessionReport> {
        let manager = self.manager.take()?;
        Some(manager.stop_all().await)
    }

    /// Release without stopping anything.
    pub fn disarm(mut self) -> Option<Arc<SessionManager>> {
        self.manager.take()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("session guard dropped, scheduling stop_all");
                handle.spawn(async move {
                    manager.stop_all().await;
                });
            }
            Err(_) => warn!("session guard dropped outside a runtime; sessions left running"),
        }
    }
}
