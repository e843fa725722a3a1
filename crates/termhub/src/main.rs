//! termhub daemon
//!
//! Headless PTY session service plus the CLI that controls it.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use termhub::config::Config;
use termhub::ipc::{
    get_daemon_pid, get_pid_file_path, is_daemon_running, IpcClient, IpcError, IpcRequest,
    IpcResponse,
};
use termhub::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use termhub::protocol::{ErrorKind, ExitInfo, ProcessStateInfo, SessionSummary};
use tracing_subscriber::EnvFilter;

/// How often `sessions output --follow` polls for new output.
const FOLLOW_POLL: Duration = Duration::from_millis(200);

/// termhub daemon - PTY sessions shared by many consumers.
#[derive(Parser, Debug)]
#[command(name = "termhubd")]
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
    /// Start the termhub daemon in the foreground
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

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a session running PROGRAM (the configured default when omitted)
    Create {
        /// Working directory
        #[arg(long)]
        cwd: Option<String>,

        /// Terminal rows
        #[arg(long)]
        rows: Option<u16>,

        /// Terminal columns
        #[arg(long)]
        cols: Option<u16>,

        /// Extra environment variable, KEY=VALUE (repeatable)
        #[arg(long = "env", short = 'e', value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Program and arguments
        #[arg(last = true)]
        argv: Vec<String>,
    },

    /// Submit a command line (a newline is appended)
    Send {
        /// Session ID
        session_id: String,
        /// Command text
        text: String,
    },

    /// Write raw input without a trailing newline
    Write {
        /// Session ID
        session_id: String,
        /// Data to write; `\n`, `\r`, `\t` and `\xNN` escapes are decoded
        data: String,
    },

    /// Print retained output
    Output {
        /// Session ID
        session_id: String,

        /// Absolute byte offset to read from
        #[arg(long, default_value = "0")]
        cursor: u64,

        /// Keep polling until the session ends
        #[arg(long, short)]
        follow: bool,
    },

    /// Resize a session's terminal
    Resize {
        /// Session ID
        session_id: String,
        /// Terminal rows
        rows: u16,
        /// Terminal columns
        cols: u16,
    },

    /// Forward a signal (INT, TERM, WINCH or KILL)
    Signal {
        /// Session ID
        session_id: String,
        /// Signal name or number
        signal: String,
    },

    /// Terminate a session and remove it
    Kill {
        /// Session ID to kill
        session_id: String,

        /// Skip the grace period and send SIGKILL at once
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    config.validate()?;
    let socket_path = config.socket_path();

    match cli.command {
        Commands::Start => {
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  termhubd stop");
                std::process::exit(1);
            }

            let orchestrator =
                DaemonOrchestrator::new(config)?.with_pid_file(get_pid_file_path());
            run_headless(&orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!("Stopping daemon (force: {})", force);

            let result = if force {
                force_stop_daemon(&socket_path)
            } else {
                graceful_stop_daemon(&socket_path, timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: termhubd stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            let mut client = connect(&socket_path).await?;
            match client.status().await? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    session_count,
                    live_sessions,
                    max_sessions,
                } => {
                    println!(
                        "Daemon Status: {}",
                        if running { "running" } else { "stopped" }
                    );
                    println!("  Uptime:   {}", format_duration(uptime_secs));
                    println!(
                        "  Sessions: {} ({} live, max {})",
                        session_count, live_sessions, max_sessions
                    );
                }
                other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
            }
        }
        Commands::Sessions(cmd) => {
            let mut client = connect(&socket_path).await?;
            if let Err(e) = run_sessions_command(&mut client, cmd).await {
                match e.downcast_ref::<IpcError>() {
                    Some(IpcError::Remote { kind, message }) => {
                        eprintln!("Error ({}): {}", kind, message);
                        std::process::exit(exit_code_for(*kind));
                    }
                    _ => return Err(e),
                }
            }
        }
    }

    Ok(())
}

async fn run_sessions_command(client: &mut IpcClient, cmd: SessionsCommands) -> anyhow::Result<()> {
    match cmd {
        SessionsCommands::List { json } => {
            let sessions = client.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        SessionsCommands::Create {
            cwd,
            rows,
            cols,
            env,
            argv,
        } => {
            let session_id = client
                .create_session_with(IpcRequest::CreateSession {
                    argv,
                    env,
                    cwd,
                    rows,
                    cols,
                })
                .await?;
            println!("{}", session_id);
        }
        SessionsCommands::Send { session_id, text } => {
            let invocation = client.submit(&session_id, &text).await?;
            println!("{} ({})", invocation.id, invocation.status);
        }
        SessionsCommands::Write { session_id, data } => {
            client.write(&session_id, &unescape(&data)).await?;
        }
        SessionsCommands::Output {
            session_id,
            cursor,
            follow,
        } => {
            follow_output(client, &session_id, cursor, follow).await?;
        }
        SessionsCommands::Resize {
            session_id,
            rows,
            cols,
        } => {
            client.resize(&session_id, rows, cols).await?;
            println!("Session {} resized to {}x{}", session_id, rows, cols);
        }
        SessionsCommands::Signal { session_id, signal } => {
            let signal_num = parse_signal(&signal)?;
            client.signal(&session_id, signal_num).await?;
            println!("Sent {} ({}) to session {}", signal, signal_num, session_id);
        }
        SessionsCommands::Kill { session_id, force } => {
            // Graceful termination can take the whole grace period.
            client.set_timeout(Duration::from_secs(30));
            let process = client.terminate(&session_id, force).await?;
            println!(
                "Session {} terminated: {}",
                session_id,
                describe_process(&process)
            );
        }
    }
    Ok(())
}

/// Prints output from `cursor` on; with `follow`, keeps polling until the
/// session has ended and everything was printed.
async fn follow_output(
    client: &mut IpcClient,
    session_id: &str,
    mut cursor: u64,
    follow: bool,
) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        let (data, next) = match client.drain(session_id, cursor, None).await {
            Ok(read) => read,
            Err(IpcError::Remote {
                kind: ErrorKind::Truncated,
                message,
            }) if follow => {
                // Resynchronize from the oldest retained byte.
                tracing::warn!("{}; skipping ahead", message);
                let session = client.get_session(session_id).await?;
                cursor = session.output_start;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        stdout.write_all(&data)?;
        stdout.flush()?;
        cursor = next;

        if !follow {
            return Ok(());
        }
        if data.is_empty() {
            let session = client.get_session(session_id).await?;
            let finished = matches!(session.state.as_str(), "terminated" | "error");
            if finished && cursor >= session.output_end {
                return Ok(());
            }
            tokio::time::sleep(FOLLOW_POLL).await;
        }
    }
}

async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Process exit code for a daemon-side error.
fn exit_code_for(kind: ErrorKind) -> i32 {
    if kind.is_retryable() {
        75 // EX_TEMPFAIL
    } else {
        1
    }
}

/// Parse a `KEY=VALUE` pair.
fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{}`", s)),
    }
}

/// Decodes `\n`, `\r`, `\t`, `\\` and `\xNN` escapes.
fn unescape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'\\' => out.push(b'\\'),
            b'x' if i + 4 <= bytes.len() => {
                match std::str::from_utf8(&bytes[i + 2..i + 4])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(b) => {
                        out.push(b);
                        i += 4;
                        continue;
                    }
                    None => out.extend_from_slice(&bytes[i..i + 2]),
                }
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
        i += 2;
    }
    out
}

/// Parse a signal string into a signal number.
///
/// Accepts:
/// - Numeric signals: "2", "15"
/// - Named signals: "SIGTERM", "SIGKILL", "TERM", "WINCH"
fn parse_signal(signal_str: &str) -> anyhow::Result<i32> {
    if let Ok(num) = signal_str.parse::<i32>() {
        if num > 0 && num < 32 {
            return Ok(num);
        }
        anyhow::bail!("Invalid signal number: {} (must be 1-31)", num);
    }

    let name = signal_str.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);

    match name {
        "INT" => Ok(2),
        "KILL" => Ok(9),
        "TERM" => Ok(15),
        "WINCH" => Ok(28),
        _ => anyhow::bail!("Unknown signal: {}", signal_str),
    }
}

fn describe_process(process: &ProcessStateInfo) -> String {
    match process {
        ProcessStateInfo::Starting => "starting".to_string(),
        ProcessStateInfo::Running => "running".to_string(),
        ProcessStateInfo::Draining => "draining".to_string(),
        ProcessStateInfo::Exited {
            exit: ExitInfo::Code(code),
        } => format!("exited with code {}", code),
        ProcessStateInfo::Exited {
            exit: ExitInfo::Signaled(sig),
        } => format!("killed by signal {}", sig),
        ProcessStateInfo::Failed { reason } => format!("failed: {}", reason),
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_width$}  {:>7}  {:<11}  {:>7}  {:>10}  {:>7}  {:>9}  COMMAND",
        "ID",
        "PID",
        "STATE",
        "SIZE",
        "OUTPUT",
        "DROPPED",
        "ACTIVE",
        id_width = id_width,
    );
    println!("{}", "-".repeat(id_width + 69));

    for session in sessions {
        println!(
            "{:<id_width$}  {:>7}  {:<11}  {:>7}  {:>10}  {:>7}  {:>9}  {}",
            truncate_str(&session.id, id_width),
            session.pid,
            session.state,
            format!("{}x{}", session.rows, session.cols),
            session.output_end,
            session.overflow_events,
            format_relative_time(session.last_activity),
            truncate_str(&session.argv.join(" "), 40),
            id_width = id_width,
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp in milliseconds as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = termhub::session::now_millis().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
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

/// Gracefully stop the daemon via IPC.
///
/// Sends a shutdown request and waits for the socket to disappear.
async fn graceful_stop_daemon(socket_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }
    drop(client);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(socket_path, Duration::from_millis(100))
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
fn force_stop_daemon(socket_path: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid()
        .ok_or_else(|| anyhow::anyhow!("No running daemon found in PID file"))?;
    let pid = i32::try_from(pid).map_err(|_| anyhow::anyhow!("Invalid PID in file: {}", pid))?;

    kill(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(get_pid_file_path());
    let _ = std::fs::remove_file(socket_path);

    Ok(())
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

/// Run the daemon until SIGTERM, SIGINT or an IPC `Stop`.
async fn run_headless(orchestrator: &DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected { client_id } => {
                    tracing::debug!(client_id = %client_id, "Client connected");
                }
                OrchestratorEvent::ClientDisconnected { client_id } => {
                    tracing::debug!(client_id = %client_id, "Client disconnected");
                }
                OrchestratorEvent::StopRequested => {
                    tracing::info!("Stop requested by client");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = orchestrator.stop_requested() => {}
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
