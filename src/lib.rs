//! sandbox-session: Session Supervision and Security Policy for Agent Sandboxes
//!
//! Runs inside an isolated container and gives agents a browser terminal, a
//! remote desktop and on-demand tool servers, while constraining what those
//! processes may do.
//!
//! # Key Features
//!
//! - **Process Supervision**: ttyd and a 4-stage Xvfb/XFCE/VNC/noVNC chain
//!   with SIGTERM-then-SIGKILL shutdown
//! - **Access Control**: opaque bearer tokens plus last-activity session expiry
//! - **Signed VNC Links**: HMAC-SHA256, workspace-scoped, expiring tokens
//! - **Policy Generation**: seccomp profiles and sudoers allow/deny lists
//! - **Tool Servers**: npm/uvx/pipx/pip package install before first launch
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sandbox_session::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let ctx = SandboxContext::from_config(
//!         SandboxConfig::default(),
//!         Arc::new(SystemLauncher::new()),
//!     )?;
//!
//!     let report = ctx.sessions().start_all().await;
//!     println!("terminal: {}", report.terminal.message);
//!
//!     let token = ctx.security().create_session("client-1")?;
//!     assert!(ctx.security().check_access("client-1", &token));
//!
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod process;

// Policy
pub mod security;

// Lifecycle
pub mod installer;
pub mod session;
pub mod tools;

pub mod context;

// Re-exports for convenience
pub use config::{load_config, SandboxConfig};
pub use context::SandboxContext;
pub use error::{Error, Result};

// Prelude for common imports
pub mod prelude {
    pub use crate::config::{load_config, SandboxConfig};
    pub use crate::context::SandboxContext;
    pub use crate::error::{Error, Result};
    pub use crate::installer::{InstallResult, PackageInstaller, PackageManager};
    pub use crate::process::{CommandSpec, MockLauncher, ProcessLauncher, SystemLauncher};
    pub use crate::security::{
        SecurityMiddleware, SeccompProfile, SeccompRegistry, SudoConfigValidator, VncTokenManager,
    };
    pub use crate::session::{
        DesktopManager, OperationResult, SessionGuard, SessionManager, SessionReport,
        WebTerminalManager, WebTerminalStatus,
    };
    pub use crate::tools::ToolServerManager;
}
