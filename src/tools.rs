//! Installed tool servers (e.g. MCP servers launched with `npx`/`uvx`).
//!
//! A server is installed the first time its command is seen, then spawned
//! as a long-lived child and tracked by name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ProcessConfig;
use crate::installer::{InstallResult, PackageInstaller};
use crate::process::{stop_quietly, CommandSpec, ManagedProcess, ProcessLauncher};
use crate::session::{launch, Launched, OperationResult};
use crate::Error;

struct ToolServer {
    command: String,
    process: Box<dyn ManagedProcess>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolServerStatus {
    pub name: String,
    pub command: String,
    pub pid: Option<u32>,
    pub running: bool,
}

/// Tracks tool servers by name.
pub struct ToolServerManager {
    launcher: Arc<dyn ProcessLauncher>,
    installer: Arc<PackageInstaller>,
    process_config: ProcessConfig,
    servers: Mutex<HashMap<String, ToolServer>>,
    /// Launch commands whose install step already succeeded.
    installed: Mutex<HashSet<String>>,
}

impl ToolServerManager {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        installer: Arc<PackageInstaller>,
        process_config: ProcessConfig,
    ) -> Self {
        Self {
            launcher,
            installer,
            process_config,
            servers: Mutex::new(HashMap::new()),
            installed: Mutex::new(HashSet::new()),
        }
    }

    async fn is_live(&self, name: &str) -> bool {
        let mut servers = self.servers.lock().await;
        match servers.get_mut(name).map(|server| server.process.is_alive()) {
            Some(true) => true,
            Some(false) => {
                servers.remove(name);
                false
            }
            None => false,
        }
    }

    async fn ensure_installed(
        &self,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Option<InstallResult> {
        if self.installed.lock().await.contains(command) {
            return None;
        }
        let result = self
            .installer
            .install_package(command, args, env, None)
            .await;
        if result.success {
            self.installed.lock().await.insert(command.to_string());
        }
        Some(result)
    }

    /// Install (first time only) and spawn a tool server.
    pub async fn start(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> OperationResult {
        if self.is_live(name).await {
            return OperationResult::failed(
                name,
                "tool server already running",
                Error::AlreadyRunning(name.to_string()),
            );
        }

        if let Some(install) = self.ensure_installed(command, args, env).await {
            if !install.success {
                let error = install.error.unwrap_or_else(|| "install failed".to_string());
                warn!(server = name, %error, "tool server install failed");
                return OperationResult::failed(name, "failed to install tool server", error);
            }
        }

        let mut tokens = shell_words::split(command)
            .unwrap_or_else(|_| command.split_whitespace().map(String::from).collect());
        tokens.extend(args.iter().cloned());
        let Some((program, rest)) = tokens.split_first() else {
            return OperationResult::failed(
                name,
                "failed to start tool server",
                Error::Config("empty tool server command".into()),
            );
        };

        let mut spec = CommandSpec::new(program.as_str()).args(rest.iter().cloned());
        for (key, value) in env {
            spec = spec.env(key, value);
        }
        spec = spec.env("DEBIAN_FRONTEND", "noninteractive");

        let launched = launch(
            self.launcher.as_ref(),
            spec,
            "install the tool server's runtime first",
            self.process_config.startup_probe,
        )
        .await;
        let process = match launched {
            Ok(Launched::Running(process)) => process,
            Ok(Launched::Exited(exit)) => {
                let e = Error::ExitedEarly {
                    component: name.to_string(),
                    status: exit.to_string(),
                };
                warn!(server = name, error = %e, "tool server exited during startup");
                return OperationResult::failed(name, "failed to start tool server", e);
            }
            Err(e) => {
                warn!(server = name, error = %e, "tool server failed to start");
                return OperationResult::failed(name, "failed to start tool server", e);
            }
        };

        let pid = process.pid();
        let mut servers = self.servers.lock().await;
        if servers.contains_key(name) {
            // Lost a race with a concurrent start of the same name.
            drop(servers);
            let mut process = process;
            stop_quietly(&mut process, self.process_config.stop_grace).await;
            return OperationResult::failed(
                name,
                "tool server already running",
                Error::AlreadyRunning(name.to_string()),
            );
        }
        servers.insert(
            name.to_string(),
            ToolServer {
                command: command.to_string(),
                process,
            },
        );
        info!(server = name, pid = ?pid, "tool server started");
        OperationResult::ok(name, "tool server started").with_pid(pid)
    }

    /// Stop a server by name. An unknown name is not an error.
    pub async fn stop(&self, name: &str) -> OperationResult {
        let server = self.servers.lock().await.remove(name);
        match server {
            Some(mut server) => {
                stop_quietly(&mut server.process, self.process_config.stop_grace).await;
                info!(server = name, "tool server stopped");
                OperationResult::ok(name, "tool server stopped")
            }
            None => OperationResult::ok(name, "tool server was not running"),
        }
    }

    pub async fn stop_all(&self) -> Vec<OperationResult> {
        let drained: Vec<(String, ToolServer)> = self.servers.lock().await.drain().collect();
        let grace = self.process_config.stop_grace;
        let mut results = Vec::with_capacity(drained.len());
        for (name, mut server) in drained {
            stop_quietly(&mut server.process, grace).await;
            results.push(OperationResult::ok(&name, "tool server stopped"));
        }
        results.sort_by(|a, b| a.component.cmp(&b.component));
        results
    }

    /// Every tracked server, sorted by name.
    pub async fn status(&self) -> Vec<ToolServerStatus> {
        let mut servers = self.servers.lock().await;
        let mut out: Vec<ToolServerStatus> = servers
            .iter_mut()
            .map(|(name, server)| ToolServerStatus {
                name: name.clone(),
                command: server.command.clone(),
                pid: server.process.pid(),
                running: server.process.is_alive(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn stop_grace(&self) -> Duration {
        self.process_config.stop_grace
    }
}
