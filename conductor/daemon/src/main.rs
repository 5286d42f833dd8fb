//! Agent Conductor Daemon
//!
//! Supervises one external agent process and exposes it to surfaces: an
//! interactive console on this terminal and a WebSocket server for remote
//! clients.
//!
//! # Usage
//!
//! ```bash
//! # Start with the config file in ~/.config/agent-conductor/conductor.toml
//! agent-conductor
//!
//! # Pick provider and model, WebSocket only
//! agent-conductor --provider google --model gemini-2.5-flash --no-console
//!
//! # With verbose logging
//! RUST_LOG=debug agent-conductor
//! ```
//!
//! # Environment Variables
//!
//! - `AGENT_CONDUCTOR_CONFIG`: config file path
//! - `AGENT_PROGRAM`, `AGENT_WORKDIR`: agent executable and working directory
//! - `AGENT_PROVIDER`, `AGENT_MODEL`: default provider and model
//! - `AGENT_CONDUCTOR_BIND`: WebSocket listen address
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: stop the agent (closing its stdin), then exit

mod commands;
mod console;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use agent_conductor::{
    default_config_path, load_config_from_path, Broadcaster, ConfigOverrides, Supervisor,
};

use crate::commands::spawn_command_loop;
use crate::console::{run_console, ConsoleExit};
use crate::server::SurfaceServer;

const DEFAULT_LOG_FILTER: &str = "agent_conductor=info,agent_conductor_daemon=info";

/// Command queue depth of the supervisor loop
const COMMAND_CAPACITY: usize = 64;

/// Supervise a long-running agent and serve it to console and WebSocket surfaces
#[derive(Debug, Parser)]
#[command(name = "agent-conductor", version, about)]
struct Args {
    /// Config file (default: ~/.config/agent-conductor/conductor.toml)
    #[arg(short, long, env = "AGENT_CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Agent executable
    #[arg(long)]
    program: Option<String>,

    /// Agent working directory
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Provider passed to the agent
    #[arg(short, long)]
    provider: Option<String>,

    /// Model passed to the agent
    #[arg(short, long)]
    model: Option<String>,

    /// WebSocket listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Disable the interactive console
    #[arg(long)]
    no_console: bool,

    /// Disable the WebSocket server
    #[arg(long)]
    no_websocket: bool,

    /// Do not launch the agent on startup
    #[arg(long)]
    no_autostart: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            program: self.program.clone(),
            working_dir: self.workdir.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            bind_address: self.bind.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the console
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    if args.no_console && args.no_websocket {
        anyhow::bail!("--no-console and --no-websocket leave no surface to serve");
    }

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path.clone()).with_context(|| {
        format!(
            "Failed to load configuration{}",
            config_path
                .as_ref()
                .map(|p| format!(" from {}", p.display()))
                .unwrap_or_default()
        )
    })?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        program = %config.agent.program,
        settings = %config.agent.settings,
        "Starting agent conductor"
    );

    let broadcaster = Broadcaster::new();
    let supervisor = Supervisor::from_config(&config, broadcaster.clone());
    let (handle, command_loop) = spawn_command_loop(supervisor, COMMAND_CAPACITY);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = if args.no_websocket {
        None
    } else {
        let server = SurfaceServer::new(config.server.clone(), broadcaster.clone(), handle.clone());
        let listener = server.bind().await?;
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { server.run(listener, shutdown).await }))
    };

    if !args.no_autostart {
        handle.start(None, None).await?;
    }

    if !args.no_console {
        let console_handle = handle.clone();
        let console_broadcaster = broadcaster.clone();
        let capacity = config.server.channel_capacity;
        let shutdown = shutdown_rx.clone();
        let shutdown_tx = shutdown_tx.clone();
        let keep_running = server_task.is_some();
        tokio::spawn(async move {
            let exit = run_console(console_handle, console_broadcaster, capacity, shutdown).await;
            match exit {
                ConsoleExit::InputClosed if keep_running => {
                    info!("Console input closed, still serving WebSocket surfaces");
                }
                ConsoleExit::Shutdown => {}
                _ => {
                    shutdown_tx.send_replace(true);
                }
            }
        });
    }

    let mut shutdown_wait = shutdown_rx.clone();
    tokio::select! {
        () = wait_for_signal() => {
            shutdown_tx.send_replace(true);
        }
        _ = shutdown_wait.wait_for(|stop| *stop) => {
            info!("Shutdown requested");
        }
    }

    // Graceful shutdown
    info!("Performing graceful shutdown...");
    if handle.shutdown().await.is_err() {
        warn!("Command loop already stopped");
    }
    let grace = config.agent.shutdown_grace + Duration::from_secs(1);
    match tokio::time::timeout(grace, command_loop).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Command loop failed"),
        Err(_) => warn!("Timed out waiting for the agent to stop"),
    }

    if let Some(task) = server_task {
        if let Err(e) = task.await {
            error!(error = %e, "WebSocket server failed");
        }
    }

    info!("Shutdown complete");

    // The console's blocking stdin read cannot be cancelled and would hold
    // up runtime shutdown until the next line of input.
    if !args.no_console {
        std::process::exit(0);
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "agent-conductor",
            "--provider",
            "google",
            "-m",
            "gemini",
            "--bind",
            "0.0.0.0:9000",
            "--no-console",
        ]);
        assert!(args.no_console);
        assert!(!args.no_websocket);

        let overrides = args.overrides();
        assert_eq!(overrides.provider.as_deref(), Some("google"));
        assert_eq!(overrides.model.as_deref(), Some("gemini"));
        assert_eq!(overrides.bind_address.as_deref(), Some("0.0.0.0:9000"));
        assert!(overrides.program.is_none());
    }

    #[test]
    fn test_cli_overrides_config_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[agent]\nprogram = \"node\"\nprovider = \"openai\"\nmodel = \"gpt-4o\"\n\n[server]\nbind_address = \"127.0.0.1:9100\""
        )
        .unwrap();

        let args = Args::parse_from(["agent-conductor", "--model", "gpt-4o-mini"]);
        let mut config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        args.overrides().apply(&mut config);

        assert_eq!(config.agent.program, "node");
        assert_eq!(config.agent.settings.provider, "openai");
        assert_eq!(config.agent.settings.model, "gpt-4o-mini");
        assert_eq!(config.server.bind_address, "127.0.0.1:9100");
        assert_eq!(config.source().to_string(), "CLI");
    }

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
