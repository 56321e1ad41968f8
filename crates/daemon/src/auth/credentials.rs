//! Peer credential check.
//!
//! Uses the kernel-reported credentials of the connecting process
//! (`SO_PEERCRED` on Linux, `getpeereid` on macOS). No bytes are exchanged.

use nix::unistd::getuid;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::{AuthFuture, Authenticator, HandshakeError, PeerIdentity};

/// Accepts peers whose uid is on an allow-list.
#[derive(Debug, Clone)]
pub struct PeerCredentialAuthenticator {
    allowed_uids: Vec<u32>,
}

impl PeerCredentialAuthenticator {
    /// Create a check for `allowed_uids`.
    ///
    /// An empty list allows root and the uid the daemon runs as.
    pub fn new(allowed_uids: Vec<u32>) -> Self {
        let allowed_uids = if allowed_uids.is_empty() {
            let mut defaults = vec![0, getuid().as_raw()];
            defaults.dedup();
            defaults
        } else {
            allowed_uids
        };

        Self { allowed_uids }
    }

    /// The effective allow-list.
    pub fn allowed_uids(&self) -> &[u32] {
        &self.allowed_uids
    }

    /// Whether `uid` may connect.
    pub fn is_allowed(&self, uid: u32) -> bool {
        self.allowed_uids.contains(&uid)
    }
}

impl Authenticator for PeerCredentialAuthenticator {
    fn name(&self) -> &'static str {
        "peer-credentials"
    }

    fn authenticate<'a>(&'a self, stream: &'a mut UnixStream) -> AuthFuture<'a> {
        Box::pin(async move {
            let cred = stream.peer_cred().map_err(HandshakeError::Credentials)?;

            if !self.is_allowed(cred.uid()) {
                warn!(uid = cred.uid(), pid = ?cred.pid(), "Rejecting peer");
                return Err(HandshakeError::UnauthorizedPeer { uid: cred.uid() });
            }

            debug!(uid = cred.uid(), gid = cred.gid(), pid = ?cred.pid(), "Peer credentials accepted");

            Ok(PeerIdentity {
                uid: Some(cred.uid()),
                gid: Some(cred.gid()),
                pid: cred.pid(),
                commit: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list() {
        let auth = PeerCredentialAuthenticator::new(Vec::new());
        assert!(auth.is_allowed(0));
        assert!(auth.is_allowed(getuid().as_raw()));
    }

    #[test]
    fn test_explicit_allow_list() {
        let auth = PeerCredentialAuthenticator::new(vec![501]);
        assert_eq!(auth.allowed_uids(), &[501]);
        assert!(auth.is_allowed(501));
        assert!(!auth.is_allowed(0));
    }

    #[tokio::test]
    async fn test_accepts_own_uid() {
        let auth = PeerCredentialAuthenticator::new(vec![getuid().as_raw()]);
        let (mut server, _client) = UnixStream::pair().unwrap();

        let identity = auth.authenticate(&mut server).await.unwrap();
        assert_eq!(identity.uid, Some(getuid().as_raw()));
        assert!(identity.commit.is_none());
    }

    #[tokio::test]
    async fn test_rejects_unlisted_uid() {
        let auth = PeerCredentialAuthenticator::new(vec![u32::MAX - 1]);
        let (mut server, _client) = UnixStream::pair().unwrap();

        let err = auth.authenticate(&mut server).await.unwrap_err();
        assert!(
            matches!(err, HandshakeError::UnauthorizedPeer { uid } if uid == getuid().as_raw())
        );
    }
}
