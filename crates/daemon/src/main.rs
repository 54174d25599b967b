//! TermDeck daemon
//!
//! Owns terminal sessions and the group store, and serves the command
//! surface used by the UI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use termdeck::config::Config;
use termdeck::ipc::{running_pid, IpcClient, IpcRequest, IpcResponse, PidFile, PidFileError};
use termdeck::orchestrator::DeckOrchestrator;
use termdeck::persistence::Persistence;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// TermDeck daemon - terminal sessions organized into groups.
#[derive(Parser, Debug)]
#[command(name = "termdeck")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the TermDeck daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage live sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Inspect terminal groups
    #[command(subcommand)]
    Groups(GroupsCommands),

    /// Rescan for Claude CLI install locations and store the result
    DetectPaths,
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Kill the session of a terminal
    Kill {
        /// Terminal ID whose session to kill
        terminal_id: String,
    },
}

/// Subcommands for group inspection.
#[derive(Subcommand, Debug, Clone)]
pub enum GroupsCommands {
    /// List groups and their terminals
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let log_to_file = matches!(cli.command, Commands::Start) && config.daemon.log_to_file;
    let _log_guard = init_logging(&config, cli.verbose, log_to_file)?;

    match cli.command {
        Commands::Start => run_daemon(config).await?,
        Commands::Stop { force, timeout } => {
            tracing::info!("Stopping daemon (force: {})", force);

            let result = if force {
                force_stop_daemon(&config)
            } else {
                graceful_stop_daemon(&config, timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: termdeck stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query(&config, IpcRequest::Status).await {
            Ok(IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                group_count,
            }) => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopping" }
                );
                println!("  Uptime:   {}", format_duration(uptime_secs));
                println!("  Sessions: {}", session_count);
                println!("  Groups:   {}", group_count);
            }
            Ok(other) => exit_unexpected(other),
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(SessionsCommands::List { json }) => {
            match query(&config, IpcRequest::ListSessions).await {
                Ok(IpcResponse::Sessions { sessions }) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                Ok(other) => exit_unexpected(other),
                Err(e) => {
                    eprintln!("Failed to list sessions: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(SessionsCommands::Kill { terminal_id }) => {
            let mut client = connect(&config).await?;
            match client.kill(&terminal_id).await? {
                IpcResponse::Killed(result) if result.success => {
                    println!("Session {} terminated", terminal_id);
                }
                IpcResponse::Killed(_) => {
                    eprintln!("No session for terminal {}", terminal_id);
                    std::process::exit(1);
                }
                other => exit_unexpected(other),
            }
        }
        Commands::Groups(GroupsCommands::List { json }) => {
            // Read from the daemon when it runs, otherwise from the store file.
            let (groups, active) = match query(&config, IpcRequest::LoadGroups).await {
                Ok(IpcResponse::Groups {
                    groups,
                    last_active_group_id,
                }) => (groups, last_active_group_id),
                Ok(other) => exit_unexpected(other),
                Err(_) => Persistence::open_file(config.store_path())?.load_groups(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&groups)?);
            } else {
                print_groups(&groups, active.as_deref());
            }
        }
        Commands::DetectPaths => {
            let paths = match query(&config, IpcRequest::DetectInstallPaths).await {
                Ok(IpcResponse::InstallPaths { paths }) => paths,
                Ok(other) => exit_unexpected(other),
                Err(_) => Persistence::open_file(config.store_path())?.detect_install_paths()?,
            };
            if paths.is_empty() {
                println!("No install locations found.");
            }
            for path in paths {
                println!("{}", path);
            }
        }
    }

    Ok(())
}

/// Installs the tracing subscriber. `RUST_LOG` wins over the configured
/// level; `--verbose` forces debug.
fn init_logging(
    config: &Config,
    verbose: bool,
    log_to_file: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = if log_to_file {
        let log_dir = config.daemon.data_dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(log_dir, "termdeck.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Run the daemon until a signal or a `Stop` request arrives.
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let pid_path = config.pid_file_path();
    let _pid_file = match PidFile::acquire(&pid_path) {
        Ok(pid_file) => pid_file,
        Err(PidFileError::AlreadyRunning(pid)) => {
            eprintln!("Error: Daemon already running (PID: {})", pid);
            eprintln!();
            eprintln!("To stop the existing daemon, run:");
            eprintln!("  termdeck stop");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!("TermDeck daemon starting (PID {})...", std::process::id());

    let orchestrator = Arc::new(DeckOrchestrator::new(config)?);
    orchestrator.start().await?;

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = shutdown.cancelled() => tracing::info!("Stop requested by client"),
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&config.socket_path(), Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Connects and sends one request. Error responses become errors.
async fn query(config: &Config, request: IpcRequest) -> anyhow::Result<IpcResponse> {
    let mut client = connect(config).await?;
    match client.send(request).await? {
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        response => Ok(response),
    }
}

fn exit_unexpected(response: IpcResponse) -> ! {
    eprintln!("Unexpected response from daemon: {:?}", response);
    std::process::exit(1);
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a stop request, then waits until the socket stops accepting.
async fn graceful_stop_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = config.socket_path();
    let mut client = connect(config).await?;

    println!("Sending shutdown request...");
    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL.
fn force_stop_daemon(config: &Config) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = config.pid_file_path();
    let pid = running_pid(&pid_path)
        .ok_or_else(|| anyhow::anyhow!("No running daemon found - is the daemon running?"))?;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(config.socket_path());
    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[protocol::SessionSummary]) {
    if sessions.is_empty() {
        println!("No live sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.terminal_id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_width$}  {:>8}  {:>9}",
        "TERMINAL",
        "PID",
        "SIZE",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 21));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<id_width$}  {:>8}  {:>9}",
            session.terminal_id,
            pid,
            format!("{}x{}", session.cols, session.rows),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn print_groups(groups: &[protocol::TerminalGroup], active: Option<&str>) {
    if groups.is_empty() {
        println!("No groups.");
        return;
    }
    for group in groups {
        let marker = if Some(group.id.as_str()) == active { "*" } else { " " };
        println!(
            "{} {} [{}x{}] {} terminal(s), {} page(s)",
            marker,
            group.name,
            group.layout.rows,
            group.layout.cols,
            group.terminals.len(),
            group.page_count()
        );
        for terminal in &group.terminals {
            println!(
                "    {:<20} {:<10} {}",
                truncate_str(&terminal.label, 20),
                format!("{:?}", terminal.status).to_lowercase(),
                terminal.cwd
            );
        }
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
