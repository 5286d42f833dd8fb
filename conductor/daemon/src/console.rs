//! Console surface
//!
//! Line-based terminal front end. Reads commands from stdin and prints
//! events to stdout; logs go to stderr so the two never interleave.

use agent_conductor::{AgentEvent, Broadcaster, ChannelSink};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::commands::{LoopClosed, StatusReport, SupervisorHandle};

const HELP: &str = "\
Commands:
  /start [provider] [model]  start or restart the agent
  /stop                      stop the agent
  /status                    show agent status
  /help                      show this help
  /quit                      exit
Anything else is sent to the agent as a task.";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `/start [provider] [model]`
    Start {
        /// Provider override
        provider: Option<String>,
        /// Model override
        model: Option<String>,
    },
    /// `/stop`
    Stop,
    /// `/status`
    Status,
    /// `/help`
    Help,
    /// `/quit` or `/exit`
    Quit,
    /// A task for the agent
    Task(String),
    /// An unrecognised slash command
    Unknown(String),
    /// Blank line
    Empty,
}

impl ConsoleCommand {
    /// Parse one line of console input
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Task(line.to_string());
        };

        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default().to_lowercase();
        match name.as_str() {
            "start" | "restart" => Self::Start {
                provider: words.next().map(str::to_string),
                model: words.next().map(str::to_string),
            },
            "stop" => Self::Stop,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(name),
        }
    }
}

/// Text shown for an event, if any
#[must_use]
pub fn render_event(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::AgentOutput(text) => Some(text.clone()),
        AgentEvent::SystemMessage(text) => Some(format!("[system] {text}")),
        AgentEvent::ErrorMessage(text) => Some(format!("[error] {text}")),
        AgentEvent::TaskDone => Some("--- task done ---".to_string()),
        AgentEvent::StateChanged(state) => Some(format!("[{state}] {}", state.description())),
        AgentEvent::ReadinessChanged(_) => None,
    }
}

fn render_status(status: &StatusReport) -> String {
    let mut text = format!("state: {}\nagent: {}", status.state, status.settings);
    if let Some(pid) = status.pid {
        text.push_str(&format!("\npid: {pid}"));
    }
    if let Some(ref task) = status.pending {
        text.push_str(&format!(
            "\ntask: {} ({}, {} ms)",
            task.text,
            task.id,
            task.elapsed_ms()
        ));
    }
    text
}

/// Why the console stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The user asked to quit
    Quit,
    /// Stdin reached end-of-file
    InputClosed,
    /// The daemon is shutting down
    Shutdown,
}

/// Run the console until quit, end of input, or shutdown
pub async fn run_console(
    handle: SupervisorHandle,
    broadcaster: Broadcaster,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> ConsoleExit {
    let (sink, mut events) = ChannelSink::pair(capacity);
    let subscriber_id = broadcaster.subscribe_labeled("console", sink);

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            if let Some(text) = render_event(&event) {
                if write_line(&mut stdout, &text).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let _ = write_line(&mut stdout, "Type /help for commands.").await;

    let exit = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break ConsoleExit::Shutdown;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break ConsoleExit::InputClosed,
                    Err(e) => {
                        warn!(error = %e, "Failed to read console input");
                        break ConsoleExit::InputClosed;
                    }
                };
                match execute(&handle, ConsoleCommand::parse(&line), &mut stdout).await {
                    Ok(true) => {}
                    Ok(false) => break ConsoleExit::Quit,
                    Err(LoopClosed) => break ConsoleExit::Shutdown,
                }
            }
        }
    };

    broadcaster.unsubscribe(subscriber_id);
    printer.abort();
    debug!(?exit, "Console finished");
    exit
}

/// Apply one command; `Ok(false)` means quit
async fn execute<W>(
    handle: &SupervisorHandle,
    command: ConsoleCommand,
    out: &mut W,
) -> Result<bool, LoopClosed>
where
    W: AsyncWrite + Unpin,
{
    match command {
        ConsoleCommand::Empty => {}
        ConsoleCommand::Task(text) => handle.send(text).await?,
        ConsoleCommand::Start { provider, model } => {
            handle.start(provider.as_deref(), model.as_deref()).await?;
        }
        ConsoleCommand::Stop => handle.stop().await?,
        ConsoleCommand::Status => {
            let status = handle.status().await?;
            let _ = write_line(out, &render_status(&status)).await;
        }
        ConsoleCommand::Help => {
            let _ = write_line(out, HELP).await;
        }
        ConsoleCommand::Unknown(name) => {
            let _ = write_line(out, &format!("Unknown command /{name}. Type /help.")).await;
        }
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

async fn write_line<W>(out: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
