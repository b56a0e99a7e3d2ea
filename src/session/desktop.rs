//! Virtual desktop: Xvfb, an XFCE session, a VNC server and the noVNC
//! websocket bridge, started in that order.
//!
//! Startup is not transactional. If a later stage fails the earlier ones are
//! left running and the caller is expected to call [`DesktopManager::stop`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{launch, port_open, Launched, PROBE_CONNECT_TIMEOUT};
use crate::config::{DesktopConfig, ProcessConfig};
use crate::process::{stop_quietly, CommandSpec, ManagedProcess, ProcessLauncher};
use crate::{Error, Result};

const COMPONENT: &str = "desktop";

/// Timeout for the best-effort `vncserver -kill`.
const VNC_KILL_TIMEOUT: Duration = Duration::from_secs(10);

const XSTARTUP: &str = "#!/bin/sh\n\
unset SESSION_MANAGER\n\
unset DBUS_SESSION_BUS_ADDRESS\n\
exec startxfce4\n";

#[derive(Debug, Clone, Serialize)]
pub struct DesktopStatus {
    pub running: bool,
    pub display: String,
    pub resolution: String,
    pub xvfb_pid: Option<u32>,
    pub session_pid: Option<u32>,
    pub vnc_pid: Option<u32>,
    pub novnc_pid: Option<u32>,
    pub vnc_port: u16,
    pub novnc_port: u16,
    pub url: String,
}

/// Port reachability for a desktop this process may not own.
#[derive(Debug, Clone, Serialize)]
pub struct DesktopProbe {
    pub vnc_port: u16,
    pub vnc_listening: bool,
    pub novnc_port: u16,
    pub novnc_listening: bool,
}

/// Owns the four desktop subprocesses.
pub struct DesktopManager {
    launcher: Arc<dyn ProcessLauncher>,
    config: DesktopConfig,
    process_config: ProcessConfig,
    xvfb: Option<Box<dyn ManagedProcess>>,
    session: Option<Box<dyn ManagedProcess>>,
    vnc: Option<Box<dyn ManagedProcess>>,
    novnc: Option<Box<dyn ManagedProcess>>,
}

fn alive(slot: &mut Option<Box<dyn ManagedProcess>>) -> bool {
    slot.as_mut().is_some_and(|p| p.is_alive())
}

impl DesktopManager {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        config: DesktopConfig,
        process_config: ProcessConfig,
    ) -> Self {
        Self {
            launcher,
            config,
            process_config,
            xvfb: None,
            session: None,
            vnc: None,
            novnc: None,
        }
    }

    pub fn config(&self) -> &DesktopConfig {
        &self.config
    }

    /// The desktop is usable while the display server and the web bridge
    /// are alive.
    pub fn is_running(&mut self) -> bool {
        alive(&mut self.xvfb) && alive(&mut self.novnc)
    }

    fn has_tracked_stages(&self) -> bool {
        self.xvfb.is_some() || self.session.is_some() || self.vnc.is_some() || self.novnc.is_some()
    }

    fn xvfb_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.xvfb_binary)
            .arg(self.config.display_name())
            .args(["-screen", "0"])
            .arg(format!("{}x{}x24", self.config.width, self.config.height))
            .args(["-ac", "-nolisten", "tcp"])
    }

    fn session_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.session_binary).env("DISPLAY", self.config.display_name())
    }

    fn vnc_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.vnc_binary)
            .arg(self.config.display_name())
            .arg("-geometry")
            .arg(format!("{}x{}", self.config.width, self.config.height))
            .args(["-depth", "24", "-encoding", "Tight"])
            .args(["-compression", "5", "-quality", "8", "-noxstartup"])
            .arg("-rfbport")
            .arg(self.config.vnc_port().to_string())
            .args(["-localhost", "no", "-securitytypes", "None"])
    }

    fn novnc_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.novnc_proxy)
            .arg("--vnc")
            .arg(format!("localhost:{}", self.config.vnc_port()))
            .arg("--listen")
            .arg(self.config.novnc_port.to_string())
    }

    fn home_dir(&self) -> PathBuf {
        self.config
            .home_dir
            .clone()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/root"))
    }

    /// Create `~/.vnc/xstartup` (0755) unless it already exists.
    fn ensure_xstartup(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let vnc_dir = self.home_dir().join(".vnc");
        let path = vnc_dir.join("xstartup");
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&vnc_dir)?;
        std::fs::write(&path, XSTARTUP)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        debug!(path = %path.display(), "created vnc xstartup");
        Ok(())
    }

    async fn stage(
        &self,
        spec: CommandSpec,
        hint: &str,
        allow_daemonize: bool,
    ) -> Result<Option<Box<dyn ManagedProcess>>> {
        let program = spec.program_name().to_string();
        match launch(
            self.launcher.as_ref(),
            spec,
            hint,
            self.process_config.startup_probe,
        )
        .await?
        {
            Launched::Running(process) => {
                info!(stage = %program, pid = ?process.pid(), "desktop stage started");
                Ok(Some(process))
            }
            Launched::Exited(exit) if allow_daemonize && exit.success() => {
                info!(stage = %program, "desktop stage daemonized");
                Ok(None)
            }
            Launched::Exited(exit) => Err(Error::ExitedEarly {
                component: program,
                status: exit.to_string(),
            }),
        }
    }

    pub async fn start(&mut self) -> Result<DesktopStatus> {
        if self.is_running() {
            return Err(Error::AlreadyRunning(COMPONENT.to_string()));
        }
        if self.has_tracked_stages() {
            warn!("stopping stages left over from a partial start");
            self.stop().await;
        }
        info!(
            display = %self.config.display_name(),
            width = self.config.width,
            height = self.config.height,
            "starting desktop"
        );

        self.xvfb = self
            .stage(
                self.xvfb_command(),
                "install it with: apt-get install -y xvfb",
                false,
            )
            .await?;

        self.session = self
            .stage(
                self.session_command(),
                "install it with: apt-get install -y xfce4 xfce4-goodies",
                false,
            )
            .await?;

        if let Err(e) = self.ensure_xstartup() {
            warn!(error = %e, "could not create vnc xstartup");
        }
        self.vnc = self
            .stage(
                self.vnc_command(),
                "install it with: apt-get install -y tigervnc-standalone-server",
                true,
            )
            .await?;

        self.novnc = self
            .stage(
                self.novnc_command(),
                "install noVNC with: git clone https://github.com/novnc/noVNC /opt/noVNC",
                false,
            )
            .await?;

        info!(url = %self.url(), "desktop started");
        Ok(self.status())
    }

    /// Stop every stage in reverse order, then `vncserver -kill` regardless.
    ///
    /// Returns whether any tracked process was running.
    pub async fn stop(&mut self) -> bool {
        let grace = self.process_config.stop_grace;
        let mut stopped_any = false;
        for slot in [
            &mut self.novnc,
            &mut self.vnc,
            &mut self.session,
            &mut self.xvfb,
        ] {
            if let Some(mut process) = slot.take() {
                stopped_any = true;
                stop_quietly(&mut process, grace).await;
            }
        }

        let kill = CommandSpec::new(&self.config.vnc_binary)
            .arg("-kill")
            .arg(self.config.display_name());
        match self.launcher.run(&kill, VNC_KILL_TIMEOUT).await {
            Ok(out) if out.success() => debug!("vncserver -kill succeeded"),
            Ok(out) => debug!(output = %out.combined().trim(), "vncserver -kill reported failure"),
            Err(e) => debug!(error = %e, "vncserver -kill not run"),
        }

        if stopped_any {
            info!("desktop stopped");
        } else {
            debug!("desktop not running, nothing to stop");
        }
        stopped_any
    }

    pub async fn restart(&mut self) -> Result<DesktopStatus> {
        self.stop().await;
        self.start().await
    }

    fn url(&self) -> String {
        format!("http://localhost:{}/vnc.html", self.config.novnc_port)
    }

    pub fn status(&mut self) -> DesktopStatus {
        let running = self.is_running();
        let pid = |slot: &Option<Box<dyn ManagedProcess>>| slot.as_ref().and_then(|p| p.pid());
        DesktopStatus {
            running,
            display: self.config.display_name(),
            resolution: format!("{}x{}", self.config.width, self.config.height),
            xvfb_pid: pid(&self.xvfb),
            session_pid: pid(&self.session),
            vnc_pid: pid(&self.vnc),
            novnc_pid: pid(&self.novnc),
            vnc_port: self.config.vnc_port(),
            novnc_port: self.config.novnc_port,
            url: self.url(),
        }
    }

    /// Check the VNC and noVNC ports of a desktop described by `config`.
    pub async fn probe(config: &DesktopConfig) -> DesktopProbe {
        let (vnc, novnc) = tokio::join!(
            port_open(config.vnc_port(), PROBE_CONNECT_TIMEOUT),
            port_open(config.novnc_port, PROBE_CONNECT_TIMEOUT)
        );
        DesktopProbe {
            vnc_port: config.vnc_port(),
            vnc_listening: vnc,
            novnc_port: config.novnc_port,
            novnc_listening: novnc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockLauncher;

    fn manager(launcher: &MockLauncher, home: &std::path::Path) -> DesktopManager {
        let config = DesktopConfig {
            home_dir: Some(home.to_path_buf()),
            ..DesktopConfig::default()
        };
        DesktopManager::new(
            Arc::new(launcher.clone()),
            config,
            ProcessConfig {
                stop_grace: Duration::from_millis(10),
                startup_probe: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_stage_commands() {
        let home = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new();
        let mut desktop = manager(&launcher, home.path());
        desktop.start().await.unwrap();

        let lines: Vec<String> = launcher
            .spawned()
            .iter()
            .map(|(_, spec)| spec.to_string())
            .collect();
        assert_eq!(
            lines,
            vec![
                "Xvfb :1 -screen 0 1920x1080x24 -ac -nolisten tcp".to_string(),
                "xfce4-session".to_string(),
                "vncserver :1 -geometry 1920x1080 -depth 24 -encoding Tight -compression 5 \
                 -quality 8 -noxstartup -rfbport 5901 -localhost no -securitytypes None"
                    .to_string(),
                "/opt/noVNC/utils/novnc_proxy --vnc localhost:5901 --listen 6080".to_string(),
            ]
        );
        assert_eq!(launcher.spawned()[1].1.env_value("DISPLAY"), Some(":1"));
    }

    #[tokio::test]
    async fn test_writes_xstartup_once() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new();
        let mut desktop = manager(&launcher, home.path());
        desktop.start().await.unwrap();

        let path = home.path().join(".vnc/xstartup");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        std::fs::write(&path, "custom").unwrap();
        desktop.stop().await;
        desktop.start().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "custom");
    }

    #[tokio::test]
    async fn test_vncserver_may_daemonize() {
        let home = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new().exits_immediately("vncserver", 0);
        let mut desktop = manager(&launcher, home.path());
        let status = desktop.start().await.unwrap();
        assert!(status.running);
        assert_eq!(status.vnc_pid, None);
    }

    #[tokio::test]
    async fn test_partial_start_leaves_earlier_stages() {
        let home = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new().missing("novnc_proxy");
        let mut desktop = manager(&launcher, home.path());

        let err = desktop.start().await.unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound { .. }));
        assert_eq!(launcher.live_pids().len(), 3);
        assert!(!desktop.is_running());

        assert!(desktop.stop().await);
        assert!(launcher.live_pids().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_partial_start_stops_leftovers() {
        let home = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new().missing("novnc_proxy");
        let mut desktop = manager(&launcher, home.path());
        desktop.start().await.unwrap_err();
        let leftovers: Vec<u32> = launcher.spawned().iter().map(|(pid, _)| *pid).collect();
        assert_eq!(leftovers.len(), 3);

        desktop.start().await.unwrap_err();
        let signalled: Vec<u32> = launcher.signals().iter().map(|(pid, _)| *pid).collect();
        for pid in &leftovers {
            assert!(signalled.contains(pid), "pid {} was not sent SIGTERM", pid);
        }
        assert!(launcher
            .signals()
            .iter()
            .all(|(_, sig)| *sig == libc::SIGTERM));
        assert_eq!(launcher.live_pids().len(), 3);
    }

    #[tokio::test]
    async fn test_session_crash_is_early_exit() {
        let home = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new().exits_immediately("xfce4-session", 1);
        let mut desktop = manager(&launcher, home.path());
        match desktop.start().await {
            Err(Error::ExitedEarly { component, status }) => {
                assert_eq!(component, "xfce4-session");
                assert_eq!(status, "exit code 1");
            }
            other => panic!("unexpected: {:?}", other.map(|s| s.running)),
        }
    }

    #[tokio::test]
    async fn test_stop_runs_vnc_kill_and_survives_stuck_process() {
        let home = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new().failing_stop("xfce4-session");
        let mut desktop = manager(&launcher, home.path());
        desktop.start().await.unwrap();

        assert!(desktop.stop().await);
        assert!(!desktop.is_running());
        let runs = launcher.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].to_string(), "vncserver -kill :1");

        // not running: still issues the kill, never fails
        assert!(!desktop.stop().await);
        assert_eq!(launcher.runs().len(), 2);
    }
}
