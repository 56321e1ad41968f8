//! Connection dispatcher.
//!
//! Accepts connections on the activated listener and serves each one on its
//! own task: handshake, then one command, then close. Handlers share nothing
//! but read-only state, so a slow command never delays another connection.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{Authenticator, HandshakeError, PeerIdentity};
use crate::commands::{CommandRegistry, DecodeError, ExecutionContext, ExecutionError};

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Why a single connection ended early. Never fatal to the daemon.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer was not authenticated; nothing was decoded.
    #[error("handshake failed")]
    Handshake(#[from] HandshakeError),

    /// The command frame was invalid; nothing was executed.
    #[error("command decode failed")]
    Decode(#[from] DecodeError),

    /// The command ran and failed.
    #[error("command execution failed")]
    Execution(#[from] ExecutionError),
}

/// Serves one connection from handshake to close.
pub struct ConnectionHandler {
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<CommandRegistry>,
    context: ExecutionContext,
    handshake_timeout: Option<Duration>,
}

impl ConnectionHandler {
    /// Create a handler without a handshake timeout.
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        registry: Arc<CommandRegistry>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            authenticator,
            registry,
            context,
            handshake_timeout: None,
        }
    }

    /// Bound the handshake by `timeout`.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn authenticate(&self, stream: &mut UnixStream) -> Result<PeerIdentity, HandshakeError> {
        let handshake = self.authenticator.authenticate(stream);
        match self.handshake_timeout {
            Some(timeout) => tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| HandshakeError::Timeout(timeout))?,
            None => handshake.await,
        }
    }

    /// Authenticate, decode and execute, strictly in that order.
    ///
    /// The stream is dropped, and so closed, on every path.
    ///
    /// # Errors
    ///
    /// Returns the stage that failed. A failed stage never lets a later
    /// one run.
    pub async fn handle(&self, mut stream: UnixStream) -> Result<(), ConnectionError> {
        let identity = self.authenticate(&mut stream).await?;
        debug!(
            strategy = self.authenticator.name(),
            uid = ?identity.uid,
            commit = ?identity.commit,
            "Peer authenticated"
        );

        let command = self.registry.decode(&mut stream).await?;
        debug!(command = command.name(), "Decoded command");

        let name = command.name();
        command.execute(&self.context, &mut stream).await?;
        info!(command = name, "Command completed");

        Ok(())
    }

    /// Handle the connection and log the outcome.
    pub async fn serve(&self, stream: UnixStream) {
        match self.handle(stream).await {
            Ok(()) => {}
            Err(e @ ConnectionError::Handshake(_)) => {
                warn!("Connection rejected: {}", error_chain(&e));
            }
            Err(e) => {
                warn!("Connection aborted: {}", error_chain(&e));
            }
        }
    }
}

/// Render an error followed by its sources.
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Accept loop over the activated listener.
pub struct ConnectionServer {
    listener: UnixListener,
    handler: Arc<ConnectionHandler>,
    admission: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl ConnectionServer {
    /// Create a dispatcher.
    ///
    /// With `max_connections` set, at most that many connections are
    /// served at once; further clients wait in the listen backlog.
    pub fn new(
        listener: UnixListener,
        handler: ConnectionHandler,
        max_connections: Option<usize>,
    ) -> Self {
        Self {
            listener,
            handler: Arc::new(handler),
            admission: max_connections.map(|n| Arc::new(Semaphore::new(n))),
            tracker: TaskTracker::new(),
        }
    }

    /// Number of handlers still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Accept and dispatch until `shutdown` is cancelled.
    ///
    /// Accept errors are logged and the loop continues.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Accepting connections");

        loop {
            let permit = match &self.admission {
                Some(admission) => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(admission).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            let span = info_span!("connection", id = %Uuid::new_v4(), peer_pid = field::Empty);
            if let Some(pid) = stream.peer_cred().ok().and_then(|cred| cred.pid()) {
                span.record("peer_pid", pid);
            }

            let handler = Arc::clone(&self.handler);
            self.tracker.spawn(
                async move {
                    let _permit = permit;
                    debug!("Accepted connection");
                    handler.serve(stream).await;
                }
                .instrument(span),
            );
        }

        info!(in_flight = self.in_flight(), "Stopped accepting connections");
    }

    /// Wait for in-flight handlers, at most `timeout`.
    ///
    /// Returns `true` if every handler finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::GreetingAuthenticator;
    use crate::commands::testing::*;
    use cfdevd_protocol::{Greeting, RemoveIpAlias, WireCommand, GREETING_SIZE, SUCCESS_MARKER};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn handler(network: Arc<RecordingNetwork>) -> ConnectionHandler {
        ConnectionHandler::new(
            Arc::new(GreetingAuthenticator::new()),
            Arc::new(CommandRegistry::with_builtin()),
            context(network, Arc::new(RecordingRegistrar::default())),
        )
    }

    #[tokio::test]
    async fn test_handle_runs_command() {
        let network = Arc::new(RecordingNetwork::default());
        let (server, mut client) = UnixStream::pair().unwrap();

        client
            .write_all(&Greeting::current().encode())
            .await
            .unwrap();
        client
            .write_all(&RemoveIpAlias::new(Ipv4Addr::new(10, 0, 0, 9)).encode_frame())
            .await
            .unwrap();

        handler(network.clone()).handle(server).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply.len(), GREETING_SIZE + 1);
        assert_eq!(reply[GREETING_SIZE], SUCCESS_MARKER);
        assert_eq!(network.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_skips_execution() {
        let network = Arc::new(RecordingNetwork::default());
        let (server, mut client) = UnixStream::pair().unwrap();

        client
            .write_all(&Greeting::current().encode())
            .await
            .unwrap();
        client.write_all(&[0x42]).await.unwrap();

        let err = handler(network.clone()).handle(server).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Decode(DecodeError::UnknownCommand(0x42))
        ));
        assert!(network.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let network = Arc::new(RecordingNetwork::default());
        let (server, _client) = UnixStream::pair().unwrap();

        let err = handler(network)
            .with_handshake_timeout(Some(Duration::from_millis(50)))
            .handle(server)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Handshake(HandshakeError::Timeout(_))
        ));
    }

    #[test]
    fn test_error_chain() {
        let err = ConnectionError::Decode(DecodeError::UnknownCommand(0x42));
        assert_eq!(
            error_chain(&err),
            "command decode failed: unknown command discriminator: 0x42"
        );
    }
}
