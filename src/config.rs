//! Sandbox configuration
//!
//! Loaded from YAML or JSON, every field defaulted so an empty document is a
//! valid configuration. Durations are written as human strings (`"30s"`,
//! `"5m"`).
//!
//! ```yaml
//! workspace_dir: /workspace
//! terminal:
//!   port: 7681
//! desktop:
//!   display: 1
//!   width: 1920
//!   height: 1080
//! security:
//!   require_token: true
//!   session_timeout: 30m
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub desktop: DesktopConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub vnc: VncConfig,
    #[serde(default)]
    pub seccomp: SeccompConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
}

/// Web terminal bridge (ttyd).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_ttyd_binary")]
    pub binary: String,
    #[serde(default = "default_terminal_port")]
    pub port: u16,
    #[serde(default = "default_shell")]
    pub shell: String,
}

/// Virtual desktop chain: Xvfb, desktop session, VNC server, noVNC bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopConfig {
    #[serde(default = "default_display")]
    pub display: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_novnc_port")]
    pub novnc_port: u16,
    #[serde(default = "default_novnc_proxy")]
    pub novnc_proxy: String,
    #[serde(default = "default_xvfb_binary")]
    pub xvfb_binary: String,
    #[serde(default = "default_desktop_session")]
    pub session_binary: String,
    #[serde(default = "default_vnc_binary")]
    pub vnc_binary: String,
    /// Home directory holding `.vnc/xstartup`; `$HOME` when unset.
    #[serde(default)]
    pub home_dir: Option<PathBuf>,
}

/// First VNC port; display N listens on `VNC_BASE_PORT + N`.
pub const VNC_BASE_PORT: u16 = 5900;

/// Highest display whose VNC port still fits in a `u16`.
pub const MAX_DISPLAY: u32 = (u16::MAX - VNC_BASE_PORT) as u32;

impl DesktopConfig {
    /// VNC server port for the configured display (5900 + N).
    ///
    /// Displays above [`MAX_DISPLAY`] are rejected by `validate()`.
    pub fn vnc_port(&self) -> u16 {
        VNC_BASE_PORT + self.display.min(MAX_DISPLAY) as u16
    }

    /// X display string, e.g. `:1`.
    pub fn display_name(&self) -> String {
        format!(":{}", self.display)
    }
}

/// Subprocess supervision timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Grace period between SIGTERM and SIGKILL.
    #[serde(default = "default_stop_grace", with = "human_duration")]
    pub stop_grace: Duration,
    /// Post-launch sleep before checking the process is still alive.
    #[serde(default = "default_startup_probe", with = "human_duration")]
    pub startup_probe: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub require_token: bool,
    #[serde(default = "default_token_ttl", with = "human_duration")]
    pub token_ttl: Duration,
    #[serde(default = "default_session_timeout", with = "human_duration")]
    pub session_timeout: Duration,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Sweep interval for expired sessions; `None` disables the sweeper.
    #[serde(default = "default_autocleanup", with = "human_duration_opt")]
    pub autocleanup_interval: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VncConfig {
    #[serde(default = "default_vnc_token_ttl", with = "human_duration")]
    pub token_ttl: Duration,
    /// Environment variable holding the HMAC key.
    #[serde(default = "default_vnc_secret_env")]
    pub secret_env: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeccompConfig {
    /// Directory searched for `<name>.json` custom profiles.
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default = "default_install_timeout", with = "human_duration")]
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            terminal: TerminalConfig::default(),
            desktop: DesktopConfig::default(),
            process: ProcessConfig::default(),
            security: SecurityConfig::default(),
            vnc: VncConfig::default(),
            seccomp: SeccompConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            binary: default_ttyd_binary(),
            port: default_terminal_port(),
            shell: default_shell(),
        }
    }
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            display: default_display(),
            width: default_width(),
            height: default_height(),
            novnc_port: default_novnc_port(),
            novnc_proxy: default_novnc_proxy(),
            xvfb_binary: default_xvfb_binary(),
            session_binary: default_desktop_session(),
            vnc_binary: default_vnc_binary(),
            home_dir: None,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stop_grace: default_stop_grace(),
            startup_probe: default_startup_probe(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_token: true,
            token_ttl: default_token_ttl(),
            session_timeout: default_session_timeout(),
            max_sessions: default_max_sessions(),
            autocleanup_interval: default_autocleanup(),
        }
    }
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            token_ttl: default_vnc_token_ttl(),
            secret_env: default_vnc_secret_env(),
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            timeout: default_install_timeout(),
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/workspace")
}

fn default_ttyd_binary() -> String {
    "ttyd".to_string()
}

fn default_terminal_port() -> u16 {
    7681
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_display() -> u32 {
    1
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_novnc_port() -> u16 {
    6080
}

fn default_novnc_proxy() -> String {
    "/opt/noVNC/utils/novnc_proxy".to_string()
}

fn default_xvfb_binary() -> String {
    "Xvfb".to_string()
}

fn default_desktop_session() -> String {
    "xfce4-session".to_string()
}

fn default_vnc_binary() -> String {
    "vncserver".to_string()
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_probe() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_sessions() -> usize {
    10
}

fn default_autocleanup() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

fn default_vnc_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_vnc_secret_env() -> String {
    "VNC_AUTH_SECRET".to_string()
}

fn default_install_timeout() -> Duration {
    Duration::from_secs(300)
}

impl SandboxConfig {
    /// Apply `SANDBOX_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("SANDBOX_WORKSPACE") {
            self.workspace_dir = PathBuf::from(v);
        }
        if let Some(port) = env_parse::<u16>("SANDBOX_TERMINAL_PORT")? {
            self.terminal.port = port;
        }
        if let Some(port) = env_parse::<u16>("SANDBOX_NOVNC_PORT")? {
            self.desktop.novnc_port = port;
        }
        if let Some(display) = env_parse::<u32>("SANDBOX_DISPLAY")? {
            self.desktop.display = display;
        }
        if let Some(require) = env_parse::<bool>("SANDBOX_REQUIRE_TOKEN")? {
            self.security.require_token = require;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.terminal.port == 0 {
            return Err(Error::Config("terminal.port cannot be 0".into()));
        }
        if self.desktop.novnc_port == 0 {
            return Err(Error::Config("desktop.novnc_port cannot be 0".into()));
        }
        if self.desktop.width == 0 || self.desktop.height == 0 {
            return Err(Error::Config(format!(
                "desktop geometry {}x{} is invalid",
                self.desktop.width, self.desktop.height
            )));
        }
        if self.desktop.display > MAX_DISPLAY {
            return Err(Error::Config(format!(
                "desktop.display {} is out of range (max {})",
                self.desktop.display, MAX_DISPLAY
            )));
        }
        if self.security.max_sessions == 0 {
            return Err(Error::Config("security.max_sessions must be at least 1".into()));
        }
        if self.security.session_timeout.is_zero() {
            return Err(Error::Config("security.session_timeout cannot be 0".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Load, override from the environment, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<SandboxConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let mut config: SandboxConfig = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    } else if raw.trim().is_empty() {
        SandboxConfig::default()
    } else {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod human_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(s) if s.eq_ignore_ascii_case("off") || s.trim().is_empty() => Ok(None),
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
