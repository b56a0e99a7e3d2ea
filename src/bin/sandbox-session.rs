use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use sandbox_session::installer::PackageInstaller;
use sandbox_session::process::SystemLauncher;
use sandbox_session::security::{SeccompRegistry, SudoConfigValidator, VncTokenManager};
use sandbox_session::session::{DesktopManager, WebTerminalStatus};
use sandbox_session::{load_config, SandboxConfig, SandboxContext};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "sandbox-session")]
#[command(about = "Terminal, desktop and security policy supervisor for agent sandboxes")]
#[command(version)]
struct Cli {
    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, global = true, env = "SANDBOX_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start terminal and desktop, run until Ctrl-C or SIGTERM
    Serve {
        #[arg(short, long, env = "SANDBOX_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Probe terminal and desktop ports
    Status {
        #[arg(short, long, env = "SANDBOX_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print or write a seccomp profile as JSON
    Seccomp {
        name: String,
        /// Directory with custom `<name>.json` profiles
        #[arg(long)]
        profile_dir: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a sudoers file for a user
    Sudoers {
        user: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Audit an existing sudoers file
    CheckSudoers { file: PathBuf },
    /// Check a command against the sudo policy
    CheckCommand {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Issue a signed VNC token for a workspace
    VncToken {
        workspace: String,
        #[arg(long, default_value = "1h")]
        ttl: String,
    },
    /// Install the package behind a tool server command
    Install {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        #[arg(long, default_value = "5m")]
        timeout: String,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    match cli.command {
        Command::Serve { config } => cmd_serve(config).await?,
        Command::Status { config } => cmd_status(config).await?,
        Command::Seccomp {
            name,
            profile_dir,
            output,
        } => cmd_seccomp(&name, profile_dir, output)?,
        Command::Sudoers { user, output } => cmd_sudoers(&user, output)?,
        Command::CheckSudoers { file } => cmd_check_sudoers(&file)?,
        Command::CheckCommand { command } => cmd_check_command(&command.join(" ")),
        Command::VncToken { workspace, ttl } => cmd_vnc_token(&workspace, &ttl)?,
        Command::Install {
            command,
            args,
            timeout,
        } => cmd_install(&command, &args, &timeout).await?,
    }

    Ok(())
}

fn init_tracing(
    log_dir: Option<&Path>,
) -> CliResult<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "sandbox-session.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

fn load(path: Option<PathBuf>) -> CliResult<SandboxConfig> {
    match path {
        Some(path) => Ok(load_config(&path)?),
        None => {
            let mut config = SandboxConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

async fn cmd_serve(config: Option<PathBuf>) -> CliResult<()> {
    let config = load(config)?;
    let ctx = Arc::new(SandboxContext::from_config(
        config,
        Arc::new(SystemLauncher::new()),
    )?);

    let report = ctx.sessions().start_all().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    ctx.security().start_autocleanup();

    wait_for_shutdown().await?;
    tracing::info!("shutdown requested");
    ctx.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown() -> CliResult<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

async fn cmd_status(config: Option<PathBuf>) -> CliResult<()> {
    let config = load(config)?;
    let (terminal, desktop) = tokio::join!(
        WebTerminalStatus::probe(config.terminal.port),
        DesktopManager::probe(&config.desktop)
    );
    let body = serde_json::json!({
        "terminal": terminal,
        "desktop": desktop,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn cmd_seccomp(name: &str, profile_dir: Option<PathBuf>, output: Option<PathBuf>) -> CliResult<()> {
    let registry = SeccompRegistry::new(profile_dir);
    let profile = registry.get_profile(name)?;
    match output {
        Some(path) => {
            profile.write_to(&path)?;
            println!("wrote {} profile to {}", name, path.display());
        }
        None => println!("{}", profile.to_json()?),
    }
    Ok(())
}

fn cmd_sudoers(user: &str, output: Option<PathBuf>) -> CliResult<()> {
    let validator = SudoConfigValidator::new();
    match output {
        Some(path) => {
            validator.write_sudoers(user, &path)?;
            println!("wrote sudoers for {} to {}", user, path.display());
        }
        None => print!("{}", validator.generate_sudoers(user)),
    }
    Ok(())
}

fn cmd_check_sudoers(file: &Path) -> CliResult<()> {
    let report = SudoConfigValidator::new().validate_sudoers_file(file);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_check_command(command: &str) {
    let validator = SudoConfigValidator::new();
    match validator.check_command(command) {
        Ok(()) => println!("allowed: {}", command),
        Err(e) => {
            println!("{}", e);
            if validator.is_dangerous(command) {
                println!("flagged as dangerous");
            }
            std::process::exit(1);
        }
    }
}

fn cmd_vnc_token(workspace: &str, ttl: &str) -> CliResult<()> {
    let ttl: Duration = humantime::parse_duration(ttl)?;
    let secret = std::env::var("VNC_AUTH_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .map(SecretString::from);
    if secret.is_none() {
        return Err("VNC_AUTH_SECRET must be set; a token signed with a throwaway key is useless".into());
    }
    let manager = VncTokenManager::new(secret, ttl)?;
    let token = manager.generate_token(workspace)?;
    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}

async fn cmd_install(command: &str, args: &[String], timeout: &str) -> CliResult<()> {
    let timeout = humantime::parse_duration(timeout)?;
    let installer = PackageInstaller::new(Arc::new(SystemLauncher::new()), timeout);
    let result = installer.install_package(command, args, &[], None).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
