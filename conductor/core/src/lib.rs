//! Agent Conductor Core - Headless Supervision of a Long-Running Agent
//!
//! This crate launches one external agent program, speaks its line-oriented
//! text protocol, and fans the decoded events out to any number of
//! surfaces. It has no UI of its own; the daemon crate puts a console and a
//! WebSocket server on top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Surfaces                               │
//! │   ┌───────────────┐   ┌──────────────────┐   ┌───────────────┐   │
//! │   │    Console    │   │ WebSocket client │   │  Test harness │   │
//! │   │ (ChannelSink) │   │   (RemoteSink)   │   │ (CallbackSink)│   │
//! │   └───────┬───────┘   └────────┬─────────┘   └───────┬───────┘   │
//! │           └────────────────────┼─────────────────────┘           │
//! │                        AgentEvent (fan-out)                      │
//! └────────────────────────────────┼─────────────────────────────────┘
//!                                  │
//! ┌────────────────────────────────┼─────────────────────────────────┐
//! │                     AGENT CONDUCTOR CORE                         │
//! │   ┌────────────────────────────┴──────────────────────────────┐  │
//! │   │                       Broadcaster                         │  │
//! │   └────────────────────────────▲──────────────────────────────┘  │
//! │   ┌────────────────────────────┴──────────────────────────────┐  │
//! │   │                       Supervisor                          │  │
//! │   │   state machine ◀── stdout reader (FramingDecoder)        │  │
//! │   │                 ◀── stderr reader (StderrClassifier)      │  │
//! │   └───────┬──────────────────▲───────────────────▲────────────┘  │
//! └───────────┼──────────────────┼───────────────────┼───────────────┘
//!           stdin              stdout             stderr
//!             ▼                  │                   │
//!        ┌────────────────────────────────────────────────┐
//!        │          agent process (provider, model)       │
//!        └────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Supervisor`]: owns the agent process and its state machine
//! - [`Broadcaster`]: delivers every [`AgentEvent`] to every subscribed sink
//! - [`FramingDecoder`]: turns stdout bytes into events
//! - [`ClientMessage`] / [`ServerMessage`]: JSON envelopes for remote surfaces
//! - [`ConductorConfig`]: merged file, environment and CLI configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use agent_conductor::{AgentSettings, Broadcaster, ChannelSink, ConductorConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = agent_conductor::load_config()?;
//!     let broadcaster = Broadcaster::new();
//!     let (sink, mut events) = ChannelSink::pair(256);
//!     broadcaster.subscribe(sink);
//!
//!     let mut supervisor = Supervisor::from_config(&config, broadcaster);
//!     supervisor.start(AgentSettings::new("google", "gemini-2.5-flash")).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if event == agent_conductor::AgentEvent::ReadinessChanged(true) {
//!             supervisor.send("open example.com and read the headline").await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: stdout framing, stderr classification, noise filter
//! - [`events`]: events and supervisor states
//! - [`tasks`]: the pending task and task text normalisation
//! - [`broadcaster`]: fan-out to sinks
//! - [`messages`]: remote JSON envelopes and the remote sink
//! - [`supervisor`]: process lifecycle
//! - [`config`]: TOML/env/CLI configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broadcaster;
pub mod config;
pub mod events;
pub mod messages;
pub mod protocol;
pub mod supervisor;
pub mod tasks;

pub use broadcaster::{
    BroadcastResult, Broadcaster, CallbackSink, ChannelSink, EventSink, SinkError, SubscriberId,
    SubscriberInfo,
};
pub use events::{AgentEvent, EventKind, SupervisorState};
pub use messages::{ClientMessage, OutputSource, RemoteSink, ServerMessage};
pub use protocol::{FramingConfig, FramingDecoder, NoiseFilter, StderrClassifier, TagRule};
pub use supervisor::{Supervisor, SupervisorError, PROCESS_STOPPED};
pub use tasks::{normalize_task_text, PendingTask, TaskId};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with_env, AgentConfig,
    AgentSettings, ConductorConfig, ConductorToml, ConfigError, ConfigOverrides, ConfigSource,
    ProtocolConfig, ServerConfig,
};
