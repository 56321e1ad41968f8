//! Greeting exchange.
//!
//! The peer speaks first. Its greeting is read in full and validated before
//! the daemon answers with its own.

use cfdevd_protocol::{Greeting, GREETING_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use super::{AuthFuture, Authenticator, PeerIdentity};

/// Validates the peer's greeting and echoes the daemon's.
#[derive(Debug, Clone)]
pub struct GreetingAuthenticator {
    greeting: Greeting,
}

impl GreetingAuthenticator {
    /// Answer with this build's greeting.
    pub fn new() -> Self {
        Self::with_greeting(Greeting::current())
    }

    /// Answer with a specific greeting.
    pub fn with_greeting(greeting: Greeting) -> Self {
        Self { greeting }
    }
}

impl Default for GreetingAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for GreetingAuthenticator {
    fn name(&self) -> &'static str {
        "greeting"
    }

    fn authenticate<'a>(&'a self, stream: &'a mut UnixStream) -> AuthFuture<'a> {
        Box::pin(async move {
            let mut buf = [0u8; GREETING_SIZE];
            stream.read_exact(&mut buf).await?;

            let peer = Greeting::decode(&buf)?;
            peer.ensure_supported()?;

            stream.write_all(&self.greeting.encode()).await?;
            stream.flush().await?;

            let commit = peer.commit();
            debug!(version = peer.version(), commit = %commit, "Greeting accepted");

            Ok(PeerIdentity {
                commit: Some(commit),
                ..Default::default()
            })
        })
    }
}
