//! Session lifecycle tests driven through `MockLauncher`.
//!
//! No ttyd, Xvfb or VNC installation is needed: every spawn is recorded and
//! every process is simulated.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sandbox_session::config::{DesktopConfig, ProcessConfig, SandboxConfig, TerminalConfig};
use sandbox_session::process::MockLauncher;
use sandbox_session::session::{DesktopManager, SessionManager, WebTerminalManager};
use sandbox_session::{Error, SandboxContext};

fn fast() -> ProcessConfig {
    ProcessConfig {
        stop_grace: Duration::from_millis(20),
        startup_probe: Duration::from_millis(1),
    }
}

fn desktop(launcher: &MockLauncher, home: &std::path::Path) -> DesktopManager {
    DesktopManager::new(
        Arc::new(launcher.clone()),
        DesktopConfig {
            home_dir: Some(home.to_path_buf()),
            ..DesktopConfig::default()
        },
        fast(),
    )
}

fn config(home: &std::path::Path) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    config.process = fast();
    config.desktop.home_dir = Some(home.to_path_buf());
    config
}

#[tokio::test]
async fn desktop_start_status_stop() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new();
    let mut desktop = desktop(&launcher, home.path());

    let status = desktop.start().await.unwrap();
    assert!(desktop.is_running());

    let spawned = launcher.spawned();
    assert_eq!(spawned.len(), 4);
    assert_eq!(status.xvfb_pid, Some(spawned[0].0));
    assert_eq!(desktop.status().xvfb_pid, Some(spawned[0].0));
    assert_eq!(status.url, "http://localhost:6080/vnc.html");

    desktop.stop().await;
    assert!(!desktop.is_running());
    assert!(launcher.live_pids().is_empty());
}

#[tokio::test]
async fn desktop_stop_escalates_to_sigkill() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new().ignores_sigterm("Xvfb");
    let mut desktop = desktop(&launcher, home.path());
    desktop.start().await.unwrap();
    let xvfb_pid = launcher.spawned()[0].0;

    desktop.stop().await;
    let xvfb_signals: Vec<i32> = launcher
        .signals()
        .into_iter()
        .filter(|(pid, _)| *pid == xvfb_pid)
        .map(|(_, sig)| sig)
        .collect();
    assert_eq!(xvfb_signals, vec![libc::SIGTERM, libc::SIGKILL]);
}

#[tokio::test]
async fn desktop_stops_in_reverse_order() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new();
    let mut desktop = desktop(&launcher, home.path());
    desktop.start().await.unwrap();

    desktop.stop().await;
    let order: Vec<u32> = launcher.signals().into_iter().map(|(pid, _)| pid).collect();
    let mut spawned: Vec<u32> = launcher.spawned().into_iter().map(|(pid, _)| pid).collect();
    spawned.reverse();
    assert_eq!(order, spawned);
}

#[tokio::test]
async fn stop_twice_is_harmless() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new();

    let mut terminal = WebTerminalManager::new(
        Arc::new(launcher.clone()),
        TerminalConfig::default(),
        fast(),
        PathBuf::from("/workspace"),
    );
    assert!(!terminal.stop().await);
    assert!(!terminal.stop().await);
    assert!(!terminal.status().running);

    let mut desktop = desktop(&launcher, home.path());
    assert!(!desktop.stop().await);
    assert!(!desktop.stop().await);
    assert!(launcher.spawned().is_empty());
}

#[tokio::test]
async fn missing_xvfb_reports_install_hint() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new().missing("Xvfb");
    let mut desktop = desktop(&launcher, home.path());

    match desktop.start().await {
        Err(Error::BinaryNotFound { binary, hint }) => {
            assert_eq!(binary, "Xvfb");
            assert!(hint.contains("xvfb"));
        }
        other => panic!("unexpected: {:?}", other.map(|s| s.running)),
    }
    assert!(launcher.spawned().is_empty());
}

#[tokio::test]
async fn session_manager_restart_all() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new();
    let manager = SessionManager::from_config(&config(home.path()), Arc::new(launcher.clone()));

    let started = manager.start_all().await;
    assert!(started.success);
    assert_eq!(launcher.live_pids().len(), 5);

    let restarted = manager.restart_all().await;
    assert!(restarted.success);
    assert_eq!(launcher.spawned().len(), 10);
    assert_eq!(launcher.live_pids().len(), 5);

    let status = manager.status().await;
    assert!(status.terminal.running);
    assert!(status.desktop.running);

    manager.stop_all().await;
    assert!(launcher.live_pids().is_empty());
}

#[tokio::test]
async fn session_manager_status_tracks_crashes() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new();
    let manager = SessionManager::from_config(&config(home.path()), Arc::new(launcher.clone()));

    let terminal = manager.start_terminal().await;
    let pid = terminal.pid.unwrap();
    launcher.crash(pid);
    assert!(!manager.status().await.terminal.running);

    // a crashed terminal can be started again without an explicit stop
    assert!(manager.start_terminal().await.success);
}

#[tokio::test]
async fn context_shutdown_stops_everything() {
    let home = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new();
    let ctx = SandboxContext::with_vnc_secret(
        config(home.path()),
        Arc::new(launcher.clone()),
        Some(secrecy::SecretString::from("k".to_string())),
    )
    .unwrap();

    ctx.sessions().start_all().await;
    let tool = ctx
        .tools()
        .start("git", "uvx mcp-server-git", &[], &[])
        .await;
    assert!(tool.success);
    assert_eq!(launcher.live_pids().len(), 6);

    ctx.shutdown().await;
    assert!(launcher.live_pids().is_empty());
}
