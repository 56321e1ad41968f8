//! Connection authentication.
//!
//! Every accepted connection passes an [`Authenticator`] before a single
//! command byte is read. Authentication fails closed: on any error the
//! connection is dropped without a response.
//!
//! ## Strategies
//!
//! - [`PeerCredentialAuthenticator`]: kernel-reported peer uid must be allowed
//! - [`GreetingAuthenticator`]: fixed-size greeting exchange
//! - [`ChainAuthenticator`]: runs several strategies in order
//!
//! The configured strategy is built with [`from_config`].

mod credentials;
mod greeting;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use cfdevd_protocol::ProtocolError;
use thiserror::Error;
use tokio::net::UnixStream;

use crate::config::{AuthConfig, AuthStrategy};

pub use credentials::PeerCredentialAuthenticator;
pub use greeting::GreetingAuthenticator;

/// Future returned by [`Authenticator::authenticate`].
pub type AuthFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PeerIdentity, HandshakeError>> + Send + 'a>>;

/// What the handshake learned about the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Peer user id, when credentials were checked.
    pub uid: Option<u32>,
    /// Peer group id, when credentials were checked.
    pub gid: Option<u32>,
    /// Peer process id, when the platform reports it.
    pub pid: Option<i32>,
    /// Commit identifier announced in the peer's greeting.
    pub commit: Option<String>,
}

impl PeerIdentity {
    /// Combine two partial identities, preferring fields set in `other`.
    pub fn merge(self, other: PeerIdentity) -> PeerIdentity {
        PeerIdentity {
            uid: other.uid.or(self.uid),
            gid: other.gid.or(self.gid),
            pid: other.pid.or(self.pid),
            commit: other.commit.or(self.commit),
        }
    }
}

/// Reasons a connection is refused before its command is read.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Reading or writing handshake bytes failed, including early EOF.
    #[error("handshake I/O failed")]
    Io(#[from] io::Error),

    /// The kernel did not report peer credentials.
    #[error("failed to read peer credentials")]
    Credentials(#[source] io::Error),

    /// The peer's uid is not on the allow-list.
    #[error("peer uid {uid} is not allowed")]
    UnauthorizedPeer { uid: u32 },

    /// The peer's greeting is malformed or announces another version.
    #[error("invalid greeting")]
    Protocol(#[from] ProtocolError),

    /// The handshake did not finish in time.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// A pluggable handshake strategy.
pub trait Authenticator: Send + Sync {
    /// Strategy name, as used in configuration and logs.
    fn name(&self) -> &'static str;

    /// Authenticate the peer on `stream`.
    ///
    /// Implementations must not write anything before the peer has been
    /// validated.
    fn authenticate<'a>(&'a self, stream: &'a mut UnixStream) -> AuthFuture<'a>;
}

/// Runs several strategies in order; all of them must succeed.
pub struct ChainAuthenticator {
    name: &'static str,
    steps: Vec<Box<dyn Authenticator>>,
}

impl ChainAuthenticator {
    /// Create a chain reported under `name`.
    pub fn new(name: &'static str, steps: Vec<Box<dyn Authenticator>>) -> Self {
        Self { name, steps }
    }

    /// Names of the chained strategies, in order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }
}

impl Authenticator for ChainAuthenticator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn authenticate<'a>(&'a self, stream: &'a mut UnixStream) -> AuthFuture<'a> {
        Box::pin(async move {
            let mut identity = PeerIdentity::default();
            for step in &self.steps {
                let learned = step.authenticate(stream).await?;
                identity = identity.merge(learned);
            }
            Ok(identity)
        })
    }
}

/// Build the authenticator selected by the configuration.
pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match config.strategy {
        AuthStrategy::PeerCredentials => Arc::new(PeerCredentialAuthenticator::new(
            config.allowed_uids.clone(),
        )),
        AuthStrategy::Greeting => Arc::new(GreetingAuthenticator::new()),
        AuthStrategy::PeerCredentialsAndGreeting => Arc::new(ChainAuthenticator::new(
            "peer-credentials+greeting",
            vec![
                Box::new(PeerCredentialAuthenticator::new(config.allowed_uids.clone())),
                Box::new(GreetingAuthenticator::new()),
            ],
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfdevd_protocol::{Greeting, GREETING_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_from_config_names() {
        let mut config = AuthConfig::default();
        assert_eq!(from_config(&config).name(), "peer-credentials+greeting");

        config.strategy = AuthStrategy::PeerCredentials;
        assert_eq!(from_config(&config).name(), "peer-credentials");

        config.strategy = AuthStrategy::Greeting;
        assert_eq!(from_config(&config).name(), "greeting");
    }

    #[test]
    fn test_identity_merge() {
        let creds = PeerIdentity {
            uid: Some(0),
            gid: Some(0),
            pid: Some(99),
            commit: None,
        };
        let greeting = PeerIdentity {
            commit: Some("abc".to_string()),
            ..Default::default()
        };

        let merged = creds.merge(greeting);
        assert_eq!(merged.uid, Some(0));
        assert_eq!(merged.pid, Some(99));
        assert_eq!(merged.commit.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_chain_runs_all_steps() {
        let chain = ChainAuthenticator::new(
            "both",
            vec![
                Box::new(PeerCredentialAuthenticator::new(Vec::new())),
                Box::new(GreetingAuthenticator::new()),
            ],
        );
        assert_eq!(chain.step_names(), vec!["peer-credentials", "greeting"]);

        let (mut server, mut client) = UnixStream::pair().unwrap();
        let peer = tokio::spawn(async move {
            client
                .write_all(&Greeting::current().encode())
                .await
                .unwrap();
            let mut reply = [0u8; GREETING_SIZE];
            client.read_exact(&mut reply).await.unwrap();
            Greeting::decode(&reply).unwrap()
        });

        let identity = chain.authenticate(&mut server).await.unwrap();
        assert_eq!(identity.uid, Some(nix::unistd::getuid().as_raw()));
        assert!(identity.commit.unwrap().starts_with("cfdevd-"));
        assert_eq!(peer.await.unwrap(), Greeting::current());
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_failure() {
        let chain = ChainAuthenticator::new(
            "both",
            vec![
                Box::new(PeerCredentialAuthenticator::new(vec![u32::MAX - 1])),
                Box::new(GreetingAuthenticator::new()),
            ],
        );

        let (mut server, mut client) = UnixStream::pair().unwrap();
        client
            .write_all(&Greeting::current().encode())
            .await
            .unwrap();

        let err = chain.authenticate(&mut server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnauthorizedPeer { .. }));

        // The greeting step never ran: the client's greeting is still unread
        let mut pending = [0u8; GREETING_SIZE];
        server.read_exact(&mut pending).await.unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }
}
