//! # cfdevd Library
//!
//! A small privileged helper service. Unprivileged tooling connects to a
//! socket that the service manager binds and hands over on activation, and
//! asks the helper to perform one privileged action per connection, such as
//! aliasing an address on the loopback interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ Activation  │──►│  Connection  │──►│  per-connection  │   │
//! │  │  listener   │   │    Server    │   │     handler      │   │
//! │  └─────────────┘   └──────────────┘   └────────┬─────────┘   │
//! │                                                │             │
//! │        ┌──────────────┬────────────────────────┤             │
//! │        ▼              ▼                        ▼             │
//! │  ┌───────────┐  ┌───────────┐  ┌─────────────────────────┐   │
//! │  │   Auth    │  │ Command   │  │  Network / Registrar    │   │
//! │  │ strategy  │  │ registry  │  │     capabilities        │   │
//! │  └───────────┘  └───────────┘  └─────────────────────────┘   │
//! │                                                              │
//! │  Signal watcher ──► CancellationToken ──► accept loop        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cfdevd::activation::SystemdActivation;
//! use cfdevd::signals::SignalWatcher;
//! use cfdevd::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = DaemonOrchestrator::new(Config::load_default()?);
//!     SignalWatcher::register()?.spawn(orchestrator.shutdown_token());
//!
//!     orchestrator.run(&mut SystemdActivation::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`activation`]: Listener acquisition by socket name
//! - [`auth`]: Pluggable handshake strategies
//! - [`commands`]: Command registry, execution context and built-in commands
//! - [`ipc`]: Connection dispatcher and client
//! - [`registrar`]: Service install/uninstall
//! - [`signals`]: SIGINT/SIGTERM watcher
//! - [`notify`]: sd_notify readiness messages
//! - [`orchestrator`]: Main daemon coordinator

pub mod activation;
pub mod auth;
pub mod commands;
pub mod config;
pub mod ipc;
pub mod notify;
pub mod orchestrator;
pub mod registrar;
pub mod signals;

// Re-export protocol for convenience
pub use cfdevd_protocol as protocol;

pub use activation::{ActivationSource, InMemoryActivation, ListenerError, SystemdActivation};
pub use auth::{Authenticator, HandshakeError, PeerIdentity};
pub use commands::{
    Command, CommandRegistry, DecodeError, ExecutionContext, ExecutionError, NetworkConfigurator,
};
pub use config::Config;
pub use ipc::{ClientError, ConnectionError, DaemonClient};
pub use orchestrator::{DaemonOrchestrator, ShutdownReport};
pub use registrar::{DaemonSpec, RegistrationError, ServiceRegistrar, SystemdRegistrar};
