//! Client for sending privileged commands to the daemon.
//!
//! One connection carries one command, so [`DaemonClient::send`] consumes
//! the client.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use cfdevd_protocol::{
    AddIpAlias, Greeting, ProtocolError, RemoveIpAlias, Uninstall, WireCommand, GREETING_SIZE,
    SUCCESS_MARKER,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Errors that can occur while talking to the daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An I/O error occurred, including timeouts.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The daemon's greeting, or a command argument, is invalid.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The daemon closed the connection without confirming.
    #[error("daemon closed the connection without confirming the command")]
    Rejected,

    /// The daemon answered with something other than the success marker.
    #[error("unexpected response byte {0:#04x}")]
    UnexpectedResponse(u8),
}

fn timed_out(what: &str) -> ClientError {
    ClientError::Io(io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out")))
}

/// Map "the daemon hung up" onto [`ClientError::Rejected`].
fn closed_by_daemon(e: io::Error) -> ClientError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => ClientError::Rejected,
        _ => ClientError::Io(e),
    }
}

/// An authenticated connection to the daemon.
pub struct DaemonClient {
    stream: UnixStream,
    timeout: Duration,
    server_greeting: Greeting,
}

impl DaemonClient {
    /// Connect to the daemon at `path` and complete the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// daemon refuses the handshake.
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect with a custom timeout for every later operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails or times
    /// out.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let mut stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection"))??;

        let server_greeting = tokio::time::timeout(timeout, Self::handshake(&mut stream))
            .await
            .map_err(|_| timed_out("handshake"))??;

        Ok(Self {
            stream,
            timeout,
            server_greeting,
        })
    }

    async fn handshake(stream: &mut UnixStream) -> Result<Greeting, ClientError> {
        stream
            .write_all(&Greeting::current().encode())
            .await
            .map_err(closed_by_daemon)?;

        let mut reply = [0u8; GREETING_SIZE];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(closed_by_daemon)?;

        let greeting = Greeting::decode(&reply)?;
        greeting.ensure_supported()?;
        Ok(greeting)
    }

    /// The greeting the daemon answered with.
    pub fn server_greeting(&self) -> &Greeting {
        &self.server_greeting
    }

    /// Set the timeout for [`DaemonClient::send`].
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send `command` and wait for the success marker.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] if the daemon closes the
    /// connection instead of confirming, for instance because the command
    /// failed.
    pub async fn send<C: WireCommand>(mut self, command: &C) -> Result<(), ClientError> {
        let frame = command.encode_frame();
        let timeout = self.timeout;

        tokio::time::timeout(timeout, async move {
            self.stream
                .write_all(&frame)
                .await
                .map_err(closed_by_daemon)?;

            let marker = self.stream.read_u8().await.map_err(closed_by_daemon)?;
            if marker != SUCCESS_MARKER {
                return Err(ClientError::UnexpectedResponse(marker));
            }
            Ok::<(), ClientError>(())
        })
        .await
        .map_err(|_| timed_out("command"))?
    }

    /// Alias `address` with `netmask` on the daemon's loopback interface.
    pub async fn add_ip_alias(self, address: Ipv4Addr, netmask: Ipv4Addr) -> Result<(), ClientError> {
        let command = AddIpAlias::new(address, netmask)?;
        self.send(&command).await
    }

    /// Remove the loopback alias `address`.
    pub async fn remove_ip_alias(self, address: Ipv4Addr) -> Result<(), ClientError> {
        self.send(&RemoveIpAlias::new(address)).await
    }

    /// Ask the daemon to remove its own service registration.
    pub async fn uninstall(self) -> Result<(), ClientError> {
        self.send(&Uninstall).await
    }
}
