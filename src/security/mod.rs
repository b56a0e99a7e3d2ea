//! Access control for the sandbox.
//!
//! [`SecurityMiddleware`] is what request handlers talk to: it pairs a
//! [`TokenAuthenticator`] with a [`SessionTimeoutManager`] so that access
//! needs both a live session and (optionally) a valid bearer token. The
//! remaining submodules are independent policy leaves.

pub mod seccomp;
pub mod sudo;
pub mod timeout;
pub mod token;
pub mod vnc;

pub use seccomp::{SeccompAction, SeccompProfile, SeccompRegistry, SyscallRule};
pub use sudo::{matches_pattern, RuleType, SudoConfigValidator, SudoRule, SudoersReport};
pub use timeout::SessionTimeoutManager;
pub use token::TokenAuthenticator;
pub use vnc::{AuthToken, VncTokenManager};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SecurityConfig;
use crate::Result;

/// Snapshot returned by [`SecurityMiddleware::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    pub active_sessions: usize,
    pub active_tokens: usize,
    pub require_token: bool,
    pub max_sessions: usize,
    pub session_timeout_secs: u64,
    pub token_ttl_secs: u64,
    pub autocleanup_running: bool,
}

/// Session + token gate in front of sandbox operations.
pub struct SecurityMiddleware {
    config: SecurityConfig,
    authenticator: TokenAuthenticator,
    sessions: SessionTimeoutManager,
}

impl SecurityMiddleware {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            authenticator: TokenAuthenticator::new(config.token_ttl),
            sessions: SessionTimeoutManager::new(config.session_timeout, config.max_sessions),
            config,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &TokenAuthenticator {
        &self.authenticator
    }

    pub fn sessions(&self) -> &SessionTimeoutManager {
        &self.sessions
    }

    /// Register `client_id` and issue it a token.
    ///
    /// Capacity errors from the session table propagate; no token is issued
    /// in that case.
    pub fn create_session(&self, client_id: &str) -> Result<String> {
        self.sessions.register(client_id)?;
        let token = self.authenticator.generate_token()?;
        info!(client_id, "session created");
        Ok(token)
    }

    /// Whether `client_id` may proceed.
    ///
    /// With `require_token` off the token is ignored and only session
    /// liveness counts. This does not refresh activity; call
    /// [`Self::update_activity`] once the request is served.
    pub fn check_access(&self, client_id: &str, token: &str) -> bool {
        if !self.sessions.is_active(client_id) {
            debug!(client_id, "access denied: no active session");
            return false;
        }
        if self.config.require_token && !self.authenticator.validate_token(token) {
            debug!(client_id, "access denied: invalid token");
            return false;
        }
        true
    }

    pub fn update_activity(&self, client_id: &str) {
        self.sessions.update_activity(client_id);
    }

    /// Drop the session. Tokens are left to expire or be revoked separately.
    pub fn revoke_session(&self, client_id: &str) -> bool {
        let removed = self.sessions.unregister(client_id);
        if removed {
            info!(client_id, "session revoked");
        }
        removed
    }

    pub fn status(&self) -> SecurityStatus {
        SecurityStatus {
            active_sessions: self.sessions.session_count(),
            active_tokens: self.authenticator.token_count(),
            require_token: self.config.require_token,
            max_sessions: self.sessions.max_sessions(),
            session_timeout_secs: self.config.session_timeout.as_secs(),
            token_ttl_secs: self.config.token_ttl.as_secs(),
            autocleanup_running: self.sessions.is_autocleanup_running(),
        }
    }

    /// Start the session sweeper if an interval is configured.
    pub fn start_autocleanup(&self) {
        if let Some(interval) = self.config.autocleanup_interval {
            self.sessions.start_autocleanup(interval);
        }
    }

    pub async fn stop_autocleanup(&self) {
        self.sessions.stop_autocleanup().await;
    }
}
