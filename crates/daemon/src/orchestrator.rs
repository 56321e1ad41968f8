//! Daemon orchestrator wiring configuration to running components.
//!
//! The orchestrator owns the process-wide [`CancellationToken`]. It acquires
//! the activated listener, serves until the token is cancelled and then
//! applies the configured shutdown mode.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activation::{acquire_listener, ActivationSource, ListenerError};
use crate::auth::{self, Authenticator};
use crate::commands::{CommandRegistry, ExecutionContext, SystemNetworkConfigurator};
use crate::config::{Config, ShutdownMode};
use crate::ipc::{ConnectionHandler, ConnectionServer};
use crate::notify::{notify_ready, notify_status};
use crate::registrar::{DaemonSpec, SystemdRegistrar};

/// How serving ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Mode that was applied.
    pub mode: ShutdownMode,
    /// Handlers still running when the daemon stopped waiting.
    pub abandoned: usize,
}

/// Daemon orchestrator that owns every long-lived component.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Handshake strategy.
    authenticator: Arc<dyn Authenticator>,
    /// Command decoders.
    registry: Arc<CommandRegistry>,
    /// Capabilities handed to commands.
    context: ExecutionContext,
    /// Cancelled on shutdown.
    shutdown_token: CancellationToken,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator acting on the real system.
    pub fn new(config: Config) -> Self {
        let context = ExecutionContext {
            network: Arc::new(SystemNetworkConfigurator::new(&config.network.interface)),
            registrar: Arc::new(SystemdRegistrar::from_config(&config.service)),
            spec: DaemonSpec::from_config(&config),
        };

        Self {
            authenticator: auth::from_config(&config.auth),
            registry: Arc::new(CommandRegistry::with_builtin()),
            context,
            shutdown_token: CancellationToken::new(),
            config,
        }
    }

    /// Replaces the capabilities handed to commands.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Replaces the command registry.
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Replaces the handshake strategy.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the shutdown token for external tasks to observe or trigger
    /// shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Acquire the listener from `source` and serve until shutdown.
    ///
    /// In abrupt mode this returns as soon as the accept loop stops and the
    /// caller is expected to exit right away. In graceful mode it first
    /// waits for in-flight connections, bounded by the drain timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be acquired. Nothing after
    /// acquisition is fatal.
    pub async fn run<S>(&self, source: &mut S) -> Result<ShutdownReport, ListenerError>
    where
        S: ActivationSource + ?Sized,
    {
        let socket_name = &self.config.daemon.socket_name;
        let listener = acquire_listener(source, socket_name)?;

        let handler = ConnectionHandler::new(
            Arc::clone(&self.authenticator),
            Arc::clone(&self.registry),
            self.context.clone(),
        )
        .with_handshake_timeout(self.config.server.handshake_timeout());
        let server = ConnectionServer::new(listener, handler, self.config.server.connection_limit());

        info!(
            socket = %socket_name,
            auth = self.authenticator.name(),
            max_connections = self.config.server.max_connections,
            "Daemon ready"
        );
        notify_ready();
        notify_status(&format!("Serving {}", socket_name));

        server.run(self.shutdown_token.clone()).await;

        let mode = self.config.server.shutdown;
        let abandoned = match mode {
            ShutdownMode::Abrupt => server.in_flight(),
            ShutdownMode::Graceful => {
                let timeout = self.config.server.drain_timeout();
                info!(in_flight = server.in_flight(), ?timeout, "Draining connections");
                if server.drain(timeout).await {
                    0
                } else {
                    server.in_flight()
                }
            }
        };

        if abandoned > 0 {
            warn!(abandoned, "Abandoning in-flight connections");
        }
        info!("Daemon stopped");

        Ok(ShutdownReport { mode, abandoned })
    }
}
