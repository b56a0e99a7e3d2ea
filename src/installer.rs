//! Pre-install step for user-requested tool servers.
//!
//! The leading word of a launch command decides how (and whether) its
//! package is installed before the first run:
//!
//! | command              | manager | action                     |
//! |----------------------|---------|----------------------------|
//! | `npx <pkg> ...`      | npm     | `npm install -g <pkg>`     |
//! | `uvx <pkg> ...`      | uvx     | check `uvx` exists         |
//! | `pipx run <pkg> ...` | pipx    | check `pipx` exists        |
//! | `python -m <mod>`    | pip     | `pip install <mod>`        |
//! | anything else        | none    | check the binary exists    |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::process::{program_name, CommandOutput, CommandSpec, ProcessLauncher};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Uvx,
    Pipx,
    Pip,
    None,
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageManager::Npm => "npm",
            PackageManager::Uvx => "uvx",
            PackageManager::Pipx => "pipx",
            PackageManager::Pip => "pip",
            PackageManager::None => "none",
        };
        f.write_str(name)
    }
}

/// Outcome of one installation attempt. Never retried automatically.
#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub success: bool,
    pub package_manager: Option<PackageManager>,
    pub installed_command: Option<String>,
    pub error: Option<String>,
    pub output: String,
}

impl InstallResult {
    fn ok(manager: PackageManager, installed: impl Into<String>, output: String) -> Self {
        Self {
            success: true,
            package_manager: Some(manager),
            installed_command: Some(installed.into()),
            error: None,
            output,
        }
    }

    fn failed(manager: Option<PackageManager>, error: impl Into<String>, output: String) -> Self {
        Self {
            success: false,
            package_manager: manager,
            installed_command: None,
            error: Some(error.into()),
            output,
        }
    }
}

/// Split `command` and append `args`. Unbalanced quotes fall back to
/// whitespace splitting.
fn tokenize(command: &str, args: &[String]) -> Vec<String> {
    let mut tokens = shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(String::from).collect());
    tokens.extend(args.iter().cloned());
    tokens
}

/// Classify a tokenized launch command.
pub fn classify(tokens: &[String]) -> PackageManager {
    let Some(head) = tokens.first() else {
        return PackageManager::None;
    };
    match program_name(head) {
        "npx" => PackageManager::Npm,
        "uvx" => PackageManager::Uvx,
        "pipx" => PackageManager::Pipx,
        name if name.starts_with("python") && tokens.get(1).map(String::as_str) == Some("-m") => {
            PackageManager::Pip
        }
        _ => PackageManager::None,
    }
}

/// First non-flag token after the launcher word.
fn npm_package(tokens: &[String]) -> Option<&str> {
    tokens
        .iter()
        .skip(1)
        .map(String::as_str)
        .find(|t| !t.starts_with('-'))
}

/// Installs the package behind a tool-server launch command.
pub struct PackageInstaller {
    launcher: Arc<dyn ProcessLauncher>,
    default_timeout: Duration,
}

impl PackageInstaller {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, default_timeout: Duration) -> Self {
        Self {
            launcher,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Install whatever `command` needs. Failures are reported in the
    /// returned [`InstallResult`], never as an `Err`.
    pub async fn install_package(
        &self,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        timeout: Option<Duration>,
    ) -> InstallResult {
        let tokens = tokenize(command, args);
        let Some(head) = tokens.first().cloned() else {
            return InstallResult::failed(None, "empty command", String::new());
        };
        let manager = classify(&tokens);
        let timeout = timeout.unwrap_or(self.default_timeout);
        info!(command = %head, %manager, "preparing tool server");

        match manager {
            PackageManager::Npm => {
                let Some(package) = npm_package(&tokens) else {
                    return InstallResult::failed(
                        Some(manager),
                        "no package name after npx",
                        String::new(),
                    );
                };
                let spec = CommandSpec::new("npm").args(["install", "-g", package]);
                self.run_install(manager, package, spec, env, timeout).await
            }
            PackageManager::Uvx | PackageManager::Pipx => {
                // Resolved lazily per run; only the tool itself must exist.
                match self.launcher.resolve(&head) {
                    Some(path) => InstallResult::ok(
                        manager,
                        head.clone(),
                        format!("{} available at {}", head, path.display()),
                    ),
                    None => InstallResult::failed(
                        Some(manager),
                        Error::CommandNotFound(head).to_string(),
                        String::new(),
                    ),
                }
            }
            PackageManager::Pip => {
                let Some(module) = tokens.get(2).cloned() else {
                    return InstallResult::failed(
                        Some(manager),
                        "no module name after -m",
                        String::new(),
                    );
                };
                let Some(pip) = ["pip", "pip3"]
                    .into_iter()
                    .find(|p| self.launcher.resolve(p).is_some())
                else {
                    return InstallResult::failed(
                        Some(manager),
                        Error::CommandNotFound("pip".into()).to_string(),
                        String::new(),
                    );
                };
                let spec = CommandSpec::new(pip).args(["install", module.as_str()]);
                self.run_install(manager, &module, spec, env, timeout).await
            }
            PackageManager::None => match self.launcher.resolve(&head) {
                Some(path) => InstallResult::ok(
                    manager,
                    path.display().to_string(),
                    String::new(),
                ),
                None => {
                    warn!(command = %head, "tool server binary not found");
                    InstallResult::failed(
                        Some(manager),
                        Error::CommandNotFound(head).to_string(),
                        String::new(),
                    )
                }
            },
        }
    }

    async fn run_install(
        &self,
        manager: PackageManager,
        package: &str,
        mut spec: CommandSpec,
        env: &[(String, String)],
        timeout: Duration,
    ) -> InstallResult {
        for (key, value) in env {
            spec = spec.env(key, value);
        }
        spec = spec.env("DEBIAN_FRONTEND", "noninteractive");

        let output = match self.launcher.run(&spec, timeout).await {
            Ok(output) => output,
            Err(e) => {
                warn!(command = %spec, error = %e, "install command failed to launch");
                return InstallResult::failed(Some(manager), e.to_string(), String::new());
            }
        };
        self.interpret(manager, package, &spec, output, timeout)
    }

    fn interpret(
        &self,
        manager: PackageManager,
        package: &str,
        spec: &CommandSpec,
        output: CommandOutput,
        timeout: Duration,
    ) -> InstallResult {
        let combined = output.combined();
        if output.timed_out {
            warn!(command = %spec, timeout = ?timeout, "install timed out");
            return InstallResult::failed(
                Some(manager),
                format!("timed out after {}s", timeout.as_secs()),
                combined,
            );
        }
        if !output.success() {
            let status = output
                .exit_code
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "a signal".to_string());
            warn!(command = %spec, %status, "install failed");
            return InstallResult::failed(
                Some(manager),
                format!("{} install of {} failed with {}", manager, package, status),
                combined,
            );
        }
        info!(%manager, package, "package installed");
        InstallResult::ok(manager, package, combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<String> {
        tokenize(s, &[])
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&tokens("npx -y @acme/server")), PackageManager::Npm);
        assert_eq!(classify(&tokens("uvx mcp-server-git")), PackageManager::Uvx);
        assert_eq!(classify(&tokens("pipx run black")), PackageManager::Pipx);
        assert_eq!(classify(&tokens("python3 -m http.server")), PackageManager::Pip);
        assert_eq!(classify(&tokens("python script.py")), PackageManager::None);
        assert_eq!(classify(&tokens("/usr/local/bin/npx pkg")), PackageManager::Npm);
        assert_eq!(classify(&tokens("node server.js")), PackageManager::None);
        assert_eq!(classify(&[]), PackageManager::None);
    }

    #[test]
    fn test_npm_package_skips_flags() {
        assert_eq!(npm_package(&tokens("npx -y @acme/server --port 1")), Some("@acme/server"));
        assert_eq!(npm_package(&tokens("npx --yes")), None);
    }

    #[test]
    fn test_tokenize_quotes_and_args() {
        let t = tokenize("npx 'my pkg'", &["--flag".to_string()]);
        assert_eq!(t, vec!["npx", "my pkg", "--flag"]);
        let t = tokenize("npx \"unbalanced", &[]);
        assert_eq!(t, vec!["npx", "\"unbalanced"]);
    }
}
