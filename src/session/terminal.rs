//! Browser terminal (`ttyd`) supervision.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::{launch, port_open, Launched, PROBE_CONNECT_TIMEOUT};
use crate::config::{ProcessConfig, TerminalConfig};
use crate::process::{stop_quietly, CommandSpec, ManagedProcess, ProcessLauncher};
use crate::{Error, Result};

const COMPONENT: &str = "web terminal";
const INSTALL_HINT: &str = "install it with: apt-get install -y ttyd";

/// State of the terminal this manager owns.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub url: String,
    pub workspace_dir: PathBuf,
}

/// Reachability of a terminal bridge this process may not own.
#[derive(Debug, Clone, Serialize)]
pub struct WebTerminalStatus {
    pub port: u16,
    pub listening: bool,
    pub url: String,
}

impl WebTerminalStatus {
    /// Connect to `127.0.0.1:port` to see whether something is serving it.
    pub async fn probe(port: u16) -> Self {
        Self::probe_with_timeout(port, PROBE_CONNECT_TIMEOUT).await
    }

    pub async fn probe_with_timeout(port: u16, timeout: Duration) -> Self {
        Self {
            port,
            listening: port_open(port, timeout).await,
            url: terminal_url(port),
        }
    }
}

fn terminal_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Owns the single `ttyd` subprocess.
pub struct WebTerminalManager {
    launcher: Arc<dyn ProcessLauncher>,
    config: TerminalConfig,
    process_config: ProcessConfig,
    workspace_dir: PathBuf,
    process: Option<Box<dyn ManagedProcess>>,
}

impl WebTerminalManager {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        config: TerminalConfig,
        process_config: ProcessConfig,
        workspace_dir: PathBuf,
    ) -> Self {
        Self {
            launcher,
            config,
            process_config,
            workspace_dir,
            process: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Live check against the owned process; a dead handle is dropped.
    pub fn is_running(&mut self) -> bool {
        match self.process.as_mut().map(|p| p.is_alive()) {
            Some(true) => true,
            Some(false) => {
                let pid = self.process.take().and_then(|p| p.pid());
                debug!(pid = ?pid, "web terminal exited on its own");
                false
            }
            None => false,
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.binary)
            .args(["-p".to_string(), self.config.port.to_string()])
            .args(["-W", self.config.shell.as_str()])
            .cwd(&self.workspace_dir)
    }

    pub async fn start(&mut self) -> Result<TerminalStatus> {
        if self.is_running() {
            return Err(Error::AlreadyRunning(COMPONENT.to_string()));
        }

        let spec = self.command();
        let launched = launch(
            self.launcher.as_ref(),
            spec,
            INSTALL_HINT,
            self.process_config.startup_probe,
        )
        .await?;
        match launched {
            Launched::Running(process) => {
                info!(pid = ?process.pid(), port = self.config.port, "web terminal started");
                self.process = Some(process);
            }
            Launched::Exited(exit) => {
                return Err(Error::ExitedEarly {
                    component: self.config.binary.clone(),
                    status: exit.to_string(),
                });
            }
        }
        Ok(self.status())
    }

    /// Stop the terminal. Returns whether anything was running.
    pub async fn stop(&mut self) -> bool {
        let Some(mut process) = self.process.take() else {
            debug!("web terminal not running, nothing to stop");
            return false;
        };
        stop_quietly(&mut process, self.process_config.stop_grace).await;
        info!("web terminal stopped");
        true
    }

    pub async fn restart(&mut self) -> Result<TerminalStatus> {
        self.stop().await;
        self.start().await
    }

    pub fn status(&mut self) -> TerminalStatus {
        let running = self.is_running();
        TerminalStatus {
            running,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            port: self.config.port,
            url: terminal_url(self.config.port),
            workspace_dir: self.workspace_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockLauncher;

    fn manager(launcher: &MockLauncher) -> WebTerminalManager {
        WebTerminalManager::new(
            Arc::new(launcher.clone()),
            TerminalConfig::default(),
            ProcessConfig {
                stop_grace: Duration::from_millis(10),
                startup_probe: Duration::from_millis(1),
            },
            PathBuf::from("/workspace"),
        )
    }

    #[tokio::test]
    async fn test_start_uses_exact_flags() {
        let launcher = MockLauncher::new();
        let mut term = manager(&launcher);
        let status = term.start().await.unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(1000));
        assert_eq!(status.url, "http://localhost:7681");

        let (_, spec) = &launcher.spawned()[0];
        assert_eq!(spec.to_string(), "ttyd -p 7681 -W /bin/bash");
        assert_eq!(spec.cwd.as_deref(), Some(std::path::Path::new("/workspace")));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let launcher = MockLauncher::new();
        let mut term = manager(&launcher);
        term.start().await.unwrap();
        assert!(matches!(term.start().await, Err(Error::AlreadyRunning(_))));
        assert_eq!(launcher.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_binary_has_hint() {
        let launcher = MockLauncher::new().missing("ttyd");
        let mut term = manager(&launcher);
        match term.start().await {
            Err(Error::BinaryNotFound { binary, hint }) => {
                assert_eq!(binary, "ttyd");
                assert!(hint.contains("apt-get install"));
            }
            other => panic!("unexpected: {:?}", other.map(|s| s.running)),
        }
    }

    #[tokio::test]
    async fn test_early_exit() {
        let launcher = MockLauncher::new().exits_immediately("ttyd", 1);
        let mut term = manager(&launcher);
        assert!(matches!(
            term.start().await,
            Err(Error::ExitedEarly { .. })
        ));
        assert!(!term.is_running());
    }

    #[tokio::test]
    async fn test_stop_idempotent_and_crash_detected() {
        let launcher = MockLauncher::new();
        let mut term = manager(&launcher);
        assert!(!term.stop().await);

        term.start().await.unwrap();
        launcher.crash(1000);
        assert!(!term.is_running());
        assert!(!term.stop().await);

        term.start().await.unwrap();
        assert!(term.stop().await);
        assert!(!term.stop().await);
        assert!(launcher.live_pids().is_empty());
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let open = WebTerminalStatus::probe(port).await;
        assert!(open.listening);
        drop(listener);
        let closed = WebTerminalStatus::probe(port).await;
        assert!(!closed.listening);
    }
}
