//! miner-hook: lifecycle hook sender and operator client for the miner daemon.
//!
//! Called directly by agent hooks configured in ~/.claude/settings.json, and
//! by people inspecting or steering the daemon.
//!
//! ## Subcommands
//!
//! - `send`: forward a hook payload (stdin JSON) to the feed socket
//! - `sessions`, `health`, `kill`, `watch`: control socket client
//! - `install`, `uninstall`, `hook-status`: manage the hook registration

mod client;
mod logging;
mod send;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miner_core::storage::{socket_override, CONTROL_SOCKET_ENV};
use miner_core::{load_config, HookInstaller, HookStatus, MinerConfig, StoragePaths};
use miner_protocol::{Method, SessionEvent, SessionView};

#[derive(Parser)]
#[command(name = "miner-hook")]
#[command(about = "Coding-agent session monitor client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a lifecycle hook to the daemon (reads hook JSON from stdin)
    Send {
        /// Session id; overrides stdin
        #[arg(long)]
        session_id: Option<String>,

        /// Hook event name, e.g. UserPromptSubmit; overrides stdin
        #[arg(long)]
        event: Option<String>,
    },

    /// List tracked sessions
    Sessions {
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show daemon health
    Health,

    /// Terminate the process behind a tracked session
    Kill {
        #[arg(value_name = "PID")]
        pid: u32,
    },

    /// Stream session events as they happen
    Watch,

    /// Register `miner-hook send` for the agent's lifecycle hooks
    Install {
        /// Command the agent should run (default: this binary + " send")
        #[arg(long)]
        command: Option<String>,
    },

    /// Remove the hook registration
    Uninstall,

    /// Report whether the hooks are registered
    HookStatus,
}

struct Context {
    paths: StoragePaths,
    config: MinerConfig,
}

impl Context {
    fn feed_socket(&self) -> PathBuf {
        self.config.event_receiver.resolved_socket_path(&self.paths)
    }

    fn control_socket(&self) -> PathBuf {
        socket_override(CONTROL_SOCKET_ENV, None, self.paths.control_socket())
    }

    fn installer(&self, command: Option<String>) -> Result<HookInstaller, String> {
        let command = match command {
            Some(command) => command,
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| format!("Failed to locate miner-hook binary: {}", e))?;
                format!("{} send", exe.display())
            }
        };
        Ok(HookInstaller::new(self.paths.agent_settings_file(), command))
    }
}

fn main() {
    let paths = match StoragePaths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("miner-hook: {}", err);
            std::process::exit(1);
        }
    };
    let _logging_guard = logging::init(Some(&paths.logs_dir()));
    let cli = Cli::parse();

    let config = load_config(&paths.config_file()).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Failed to load config; using defaults");
        MinerConfig::default()
    });
    let context = Context { paths, config };

    match cli.command {
        Commands::Send { session_id, event } => {
            // A missing daemon must never fail the agent's hook; log and exit 0.
            if let Err(e) = send::run(
                &context.feed_socket(),
                session_id.as_deref(),
                event.as_deref(),
            ) {
                tracing::warn!(error = %e, "miner-hook send failed");
            }
        }
        command => {
            if let Err(e) = run_operator(command, &context) {
                eprintln!("miner-hook: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_operator(command: Commands, context: &Context) -> Result<(), String> {
    let socket = context.control_socket();
    match command {
        Commands::Send { .. } => Ok(()),
        Commands::Sessions { json } => {
            let data = client::call(&socket, client::request(Method::GetSessions, None))
                .map_err(|e| e.to_string())?;
            if json {
                return print_json(&data);
            }
            let sessions: Vec<SessionView> =
                serde_json::from_value(data).map_err(|e| format!("Unexpected sessions payload: {}", e))?;
            print_sessions(&sessions);
            Ok(())
        }
        Commands::Health => {
            let data = client::call(&socket, client::request(Method::GetHealth, None))
                .map_err(|e| e.to_string())?;
            print_json(&data)
        }
        Commands::Kill { pid } => {
            let params = serde_json::json!({ "pid": pid });
            client::call(&socket, client::request(Method::Kill, Some(params)))
                .map_err(|e| e.to_string())?;
            println!("Terminated {}", pid);
            Ok(())
        }
        Commands::Watch => client::subscribe(&socket, |event| {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Failed to render event"),
            }
            !matches!(event, SessionEvent::MonitorsUnreachable)
        })
        .map_err(|e| e.to_string()),
        Commands::Install { command } => {
            let installer = context.installer(command)?;
            installer.install().map_err(|e| e.to_string())?;
            println!("Hooks installed in {}", installer.settings_path().display());
            Ok(())
        }
        Commands::Uninstall => {
            let installer = context.installer(None)?;
            let removed = installer.uninstall().map_err(|e| e.to_string())?;
            println!("Removed {} hook entries", removed);
            Ok(())
        }
        Commands::HookStatus => {
            let installer = context.installer(None)?;
            match installer.status().map_err(|e| e.to_string())? {
                HookStatus::Installed => println!("installed"),
                HookStatus::NotInstalled => println!("not installed"),
                HookStatus::Partial { missing } => {
                    println!("partial (missing: {})", missing.join(", "))
                }
            }
            Ok(())
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", rendered);
    Ok(())
}

fn print_sessions(sessions: &[SessionView]) {
    if sessions.is_empty() {
        println!("No sessions");
        return;
    }
    println!(
        "{:<8} {:<38} {:<15} {:<13} {:>6} {:>9}",
        "PID", "SESSION", "STATUS", "MODE", "CPU%", "MEM(MB)"
    );
    for session in sessions {
        let mode = match session.detection_mode {
            miner_protocol::DetectionMode::Legacy => "legacy",
            miner_protocol::DetectionMode::EventDriven => "event_driven",
        };
        println!(
            "{:<8} {:<38} {:<15} {:<13} {:>6.1} {:>9}",
            session.pid,
            session.identity,
            session.status.as_str(),
            mode,
            session.cpu_usage,
            session.memory_bytes / (1024 * 1024)
        );
    }
}
