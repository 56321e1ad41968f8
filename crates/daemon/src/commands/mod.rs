//! Privileged commands and their dispatch.
//!
//! A connection carries exactly one command. The first byte after the
//! handshake selects a decoder from the [`CommandRegistry`]; the decoder
//! reads the fixed-size payload and yields a [`Command`], which then runs
//! with the daemon's privileges and owns the rest of the connection.
//!
//! ```text
//! stream ──► id byte ──► registry[id] ──► payload ──► Box<dyn Command>
//!                                                        │
//!                              ExecutionContext ──► execute(stream)
//! ```
//!
//! New command kinds only need a [`WireCommand`] codec and a [`Command`]
//! implementation; [`CommandRegistry::register`] wires them in.

mod network;
mod uninstall;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use cfdevd_protocol::{
    AddIpAlias, ProtocolError, RemoveIpAlias, Uninstall, WireCommand, SUCCESS_MARKER,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::registrar::{DaemonSpec, RegistrationError, ServiceRegistrar};

pub use network::{NetworkConfigurator, NetworkError, NetworkFuture, SystemNetworkConfigurator};

/// Future returned by [`Command::execute`].
pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send + 'a>>;

/// Future returned by a registered decoder.
pub type DecodeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn Command>, DecodeError>> + Send + 'a>>;

type DecoderFn = for<'a> fn(&'a mut UnixStream) -> DecodeFuture<'a>;

/// Errors reading a command off the connection. Nothing has executed.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The stream failed or ended before the frame was complete.
    #[error("failed to read command frame")]
    Io(#[from] io::Error),

    /// No decoder is registered for the discriminator.
    #[error("unknown command discriminator: {0:#04x}")]
    UnknownCommand(u8),

    /// The payload was read but is not valid for the command.
    #[error("malformed payload for command {id:#04x}")]
    Malformed {
        id: u8,
        #[source]
        source: ProtocolError,
    },
}

/// Errors while running a command. Only the current connection is affected.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Writing the response failed.
    #[error("failed to write response")]
    Io(#[from] io::Error),

    /// Reconfiguring the network failed.
    #[error("network configuration failed")]
    Network(#[from] NetworkError),

    /// The service registrar failed.
    #[error("service registration failed")]
    Registration(#[from] RegistrationError),

    /// A blocking helper task panicked or was cancelled.
    #[error("command task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// Everything a command may act on besides its connection.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Loopback alias management.
    pub network: Arc<dyn NetworkConfigurator>,
    /// Service (un)registration.
    pub registrar: Arc<dyn ServiceRegistrar>,
    /// This daemon's own service description.
    pub spec: DaemonSpec,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// A decoded privileged request.
pub trait Command: Send + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Perform the action and write the command's response to `stream`.
    ///
    /// On error nothing further should be written; the caller closes the
    /// connection.
    fn execute<'a>(
        self: Box<Self>,
        ctx: &'a ExecutionContext,
        stream: &'a mut UnixStream,
    ) -> CommandFuture<'a>;
}

/// Write the one-byte success marker.
pub async fn write_success(stream: &mut UnixStream) -> Result<(), ExecutionError> {
    stream.write_all(&[SUCCESS_MARKER]).await?;
    stream.flush().await?;
    Ok(())
}

fn decode_fixed<C>(stream: &mut UnixStream) -> DecodeFuture<'_>
where
    C: WireCommand + Command + 'static,
{
    Box::pin(async move {
        let mut payload = vec![0u8; C::PAYLOAD_LEN];
        stream.read_exact(&mut payload).await?;

        let command = C::decode_payload(&payload)
            .map_err(|source| DecodeError::Malformed { id: C::ID, source })?;
        Ok(Box::new(command) as Box<dyn Command>)
    })
}

/// Maps discriminator bytes to decoders.
pub struct CommandRegistry {
    decoders: HashMap<u8, DecoderFn>,
}

impl CommandRegistry {
    /// Create a registry without any command.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Create a registry with the built-in commands.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Uninstall>()
            .register::<RemoveIpAlias>()
            .register::<AddIpAlias>();
        registry
    }

    /// Register `C` under its discriminator, replacing any earlier entry.
    pub fn register<C>(&mut self) -> &mut Self
    where
        C: WireCommand + Command + 'static,
    {
        if self.decoders.insert(C::ID, decode_fixed::<C>).is_some() {
            debug!(id = C::ID, "Replaced command decoder");
        }
        self
    }

    /// Whether a decoder is registered for `id`.
    pub fn contains(&self, id: u8) -> bool {
        self.decoders.contains_key(&id)
    }

    /// Registered discriminators, ascending.
    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Read one command frame from `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error on early EOF, an unknown discriminator, or a
    /// payload the command rejects.
    pub async fn decode(&self, stream: &mut UnixStream) -> Result<Box<dyn Command>, DecodeError> {
        let id = stream.read_u8().await?;
        let decoder = self
            .decoders
            .get(&id)
            .ok_or(DecodeError::UnknownCommand(id))?;
        decoder(stream).await
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use cfdevd_protocol::{ADD_IP_ALIAS_ID, REMOVE_IP_ALIAS_ID, UNINSTALL_ID};
    use std::net::Ipv4Addr;

    async fn decode_bytes(bytes: &[u8]) -> Result<Box<dyn Command>, DecodeError> {
        let (mut server, mut client) = UnixStream::pair().unwrap();
        client.write_all(bytes).await.unwrap();
        client.shutdown().await.unwrap();
        CommandRegistry::with_builtin().decode(&mut server).await
    }

    #[test]
    fn test_builtin_ids() {
        let registry = CommandRegistry::with_builtin();
        assert_eq!(
            registry.ids(),
            vec![UNINSTALL_ID, REMOVE_IP_ALIAS_ID, ADD_IP_ALIAS_ID]
        );
        assert!(!CommandRegistry::new().contains(UNINSTALL_ID));
    }

    #[tokio::test]
    async fn test_decode_builtin_commands() {
        let add = AddIpAlias::new(Ipv4Addr::new(10, 144, 0, 34), Ipv4Addr::BROADCAST).unwrap();
        let command = decode_bytes(&add.encode_frame()).await.unwrap();
        assert_eq!(command.name(), "add-ip-alias");

        let remove = RemoveIpAlias::new(Ipv4Addr::new(10, 144, 0, 34));
        let command = decode_bytes(&remove.encode_frame()).await.unwrap();
        assert_eq!(command.name(), "remove-ip-alias");

        let command = decode_bytes(&Uninstall.encode_frame()).await.unwrap();
        assert_eq!(command.name(), "uninstall");
    }

    #[tokio::test]
    async fn test_decode_leaves_trailing_bytes() {
        let (mut server, mut client) = UnixStream::pair().unwrap();
        let mut bytes = RemoveIpAlias::new(Ipv4Addr::LOCALHOST).encode_frame();
        bytes.push(0xEE);
        client.write_all(&bytes).await.unwrap();

        CommandRegistry::with_builtin()
            .decode(&mut server)
            .await
            .unwrap();
        assert_eq!(server.read_u8().await.unwrap(), 0xEE);
    }

    #[tokio::test]
    async fn test_decode_unknown_discriminator() {
        let err = decode_bytes(&[0x42]).await.unwrap_err();
        assert!(matches!(err, DecodeError::UnknownCommand(0x42)));
    }

    #[tokio::test]
    async fn test_decode_short_payload() {
        let err = decode_bytes(&[ADD_IP_ALIAS_ID, 10, 0]).await.unwrap_err();
        assert!(matches!(err, DecodeError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_decode_empty_stream() {
        let err = decode_bytes(&[]).await.unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }

    #[tokio::test]
    async fn test_decode_bad_netmask() {
        let err = decode_bytes(&[ADD_IP_ALIAS_ID, 10, 0, 0, 1, 255, 0, 255, 0])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Malformed {
                id: ADD_IP_ALIAS_ID,
                source: ProtocolError::InvalidNetmask(_)
            }
        ));
    }

    #[derive(Debug)]
    struct Ping;

    impl WireCommand for Ping {
        const ID: u8 = 0x70;
        const PAYLOAD_LEN: usize = 0;

        fn encode_payload(&self, _buf: &mut bytes::BytesMut) {}

        fn decode_payload(_payload: &[u8]) -> cfdevd_protocol::Result<Self> {
            Ok(Ping)
        }
    }

    impl Command for Ping {
        fn name(&self) -> &'static str {
            "ping"
        }

        fn execute<'a>(
            self: Box<Self>,
            _ctx: &'a ExecutionContext,
            stream: &'a mut UnixStream,
        ) -> CommandFuture<'a> {
            Box::pin(async move {
                stream.write_all(b"pong").await?;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_register_custom_command() {
        let mut registry = CommandRegistry::with_builtin();
        registry.register::<Ping>();
        assert!(registry.contains(0x70));

        let network = Arc::new(RecordingNetwork::default());
        let registrar = Arc::new(RecordingRegistrar::default());
        let ctx = context(network, registrar);

        let (mut server, mut client) = UnixStream::pair().unwrap();
        client.write_all(&[0x70]).await.unwrap();

        let command = registry.decode(&mut server).await.unwrap();
        command.execute(&ctx, &mut server).await.unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
    }
}
