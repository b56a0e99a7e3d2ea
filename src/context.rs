//! One explicitly constructed owner for every manager in the sandbox.
//!
//! Request handlers receive an `Arc<SandboxContext>` instead of reaching for
//! process-wide globals.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::installer::PackageInstaller;
use crate::process::ProcessLauncher;
use crate::security::{SecurityMiddleware, SeccompRegistry, SudoConfigValidator, VncTokenManager};
use crate::session::{SessionGuard, SessionManager};
use crate::tools::ToolServerManager;
use crate::Result;

pub struct SandboxContext {
    instance_id: Uuid,
    config: SandboxConfig,
    launcher: Arc<dyn ProcessLauncher>,
    sessions: Arc<SessionManager>,
    security: SecurityMiddleware,
    vnc_tokens: VncTokenManager,
    seccomp: SeccompRegistry,
    sudo: SudoConfigValidator,
    installer: Arc<PackageInstaller>,
    tools: ToolServerManager,
}

impl SandboxContext {
    /// Validate `config` and build every manager around `launcher`.
    pub fn from_config(config: SandboxConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        Self::with_vnc_secret(config, launcher, None)
    }

    /// Like [`Self::from_config`] with an explicit VNC HMAC key.
    pub fn with_vnc_secret(
        config: SandboxConfig,
        launcher: Arc<dyn ProcessLauncher>,
        vnc_secret: Option<SecretString>,
    ) -> Result<Self> {
        config.validate()?;

        let instance_id = Uuid::now_v7();
        let installer = Arc::new(PackageInstaller::new(
            launcher.clone(),
            config.installer.timeout,
        ));
        let ctx = Self {
            instance_id,
            sessions: Arc::new(SessionManager::from_config(&config, launcher.clone())),
            security: SecurityMiddleware::new(config.security.clone()),
            vnc_tokens: VncTokenManager::with_secret_env(
                vnc_secret,
                &config.vnc.secret_env,
                config.vnc.token_ttl,
            )?,
            seccomp: SeccompRegistry::new(config.seccomp.profile_dir.clone()),
            sudo: SudoConfigValidator::new(),
            tools: ToolServerManager::new(
                launcher.clone(),
                installer.clone(),
                config.process.clone(),
            ),
            installer,
            launcher,
            config,
        };
        info!(
            instance_id = %ctx.instance_id,
            workspace = %ctx.config.workspace_dir.display(),
            "sandbox context initialized"
        );
        Ok(ctx)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn security(&self) -> &SecurityMiddleware {
        &self.security
    }

    pub fn vnc_tokens(&self) -> &VncTokenManager {
        &self.vnc_tokens
    }

    pub fn seccomp(&self) -> &SeccompRegistry {
        &self.seccomp
    }

    pub fn sudo(&self) -> &SudoConfigValidator {
        &self.sudo
    }

    pub fn installer(&self) -> &PackageInstaller {
        &self.installer
    }

    pub fn tools(&self) -> &ToolServerManager {
        &self.tools
    }

    /// Guard that stops the sessions when released.
    pub fn session_guard(&self) -> SessionGuard {
        self.sessions.guard()
    }

    /// Stop tool servers, sessions and the session sweeper.
    pub async fn shutdown(&self) {
        self.tools.stop_all().await;
        self.sessions.stop_all().await;
        self.security.stop_autocleanup().await;
        info!(instance_id = %self.instance_id, "sandbox context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockLauncher;
    use std::time::Duration;

    #[tokio::test]
    async fn test_context_wires_managers() {
        let launcher = MockLauncher::new();
        let mut config = SandboxConfig::default();
        config.process.startup_probe = Duration::from_millis(1);
        config.process.stop_grace = Duration::from_millis(10);
        let ctx = SandboxContext::with_vnc_secret(
            config,
            Arc::new(launcher.clone()),
            Some(SecretString::from("k".to_string())),
        )
        .unwrap();

        let token = ctx.vnc_tokens().generate_token("/workspace").unwrap();
        assert!(ctx.vnc_tokens().validate_token(&token.token, "/workspace"));
        assert!(ctx.seccomp().get_profile("default").is_ok());
        assert!(!ctx.sudo().validate_command("sudo su"));

        assert!(ctx.sessions().start_terminal().await.success);
        ctx.shutdown().await;
        assert!(launcher.live_pids().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SandboxConfig::default();
        config.security.max_sessions = 0;
        assert!(SandboxContext::from_config(config, Arc::new(MockLauncher::new())).is_err());
    }
}
