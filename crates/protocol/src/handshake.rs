//! Greeting handshake exchanged before any command is sent.
//!
//! # Greeting Format
//!
//! Each greeting is exactly [`GREETING_SIZE`] bytes:
//! - 5 bytes: magic bytes "VMN3T"
//! - 4 bytes: protocol version (little-endian)
//! - 40 bytes: commit identifier (ASCII, NUL padded)
//!
//! The client sends its greeting first. The daemon answers with its own
//! greeting only after the client's has been validated.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtocolError, Result};

/// Magic bytes opening every greeting.
pub const GREETING_MAGIC: [u8; 5] = *b"VMN3T";

/// Protocol version spoken by this build.
pub const GREETING_VERSION: u32 = 22;

/// Size of the commit identifier field.
pub const COMMIT_LENGTH: usize = 40;

/// Greeting size: 5 (magic) + 4 (version) + 40 (commit) = 49 bytes.
pub const GREETING_SIZE: usize = GREETING_MAGIC.len() + 4 + COMMIT_LENGTH;

/// A decoded greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    version: u32,
    commit: [u8; COMMIT_LENGTH],
}

impl Greeting {
    /// Create a greeting for the current protocol version.
    ///
    /// Fails when `commit` is longer than [`COMMIT_LENGTH`] bytes.
    pub fn new(commit: &str) -> Result<Self> {
        Self::with_version(GREETING_VERSION, commit)
    }

    /// Create a greeting announcing an explicit version.
    pub fn with_version(version: u32, commit: &str) -> Result<Self> {
        let bytes = commit.as_bytes();
        if bytes.len() > COMMIT_LENGTH {
            return Err(ProtocolError::CommitTooLong {
                len: bytes.len(),
                max: COMMIT_LENGTH,
            });
        }

        let mut padded = [0u8; COMMIT_LENGTH];
        padded[..bytes.len()].copy_from_slice(bytes);

        Ok(Self {
            version,
            commit: padded,
        })
    }

    /// The greeting this build sends, identified by the crate version.
    pub fn current() -> Self {
        let mut commit = [0u8; COMMIT_LENGTH];
        let id = concat!("cfdevd-", env!("CARGO_PKG_VERSION")).as_bytes();
        let len = id.len().min(COMMIT_LENGTH);
        commit[..len].copy_from_slice(&id[..len]);

        Self {
            version: GREETING_VERSION,
            commit,
        }
    }

    /// The announced protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The commit identifier with NUL padding removed.
    pub fn commit(&self) -> String {
        let end = self
            .commit
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(COMMIT_LENGTH);
        String::from_utf8_lossy(&self.commit[..end]).into_owned()
    }

    /// Check that the announced version is the one this build speaks.
    pub fn ensure_supported(&self) -> Result<()> {
        if self.version != GREETING_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                expected: GREETING_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }

    /// Encode the greeting into its fixed-size wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut output = BytesMut::with_capacity(GREETING_SIZE);
        output.put_slice(&GREETING_MAGIC);
        output.put_u32_le(self.version);
        output.put_slice(&self.commit);
        output.to_vec()
    }

    /// Decode a greeting, validating its length and magic bytes.
    ///
    /// The version is not checked here; see [`Greeting::ensure_supported`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != GREETING_SIZE {
            return Err(ProtocolError::Truncated {
                expected: GREETING_SIZE,
                got: data.len(),
            });
        }

        let mut buf = data;

        let mut magic = [0u8; 5];
        buf.copy_to_slice(&mut magic);
        if magic != GREETING_MAGIC {
            return Err(ProtocolError::InvalidMagic {
                expected: GREETING_MAGIC,
                got: magic,
            });
        }

        let version = buf.get_u32_le();

        let mut commit = [0u8; COMMIT_LENGTH];
        buf.copy_to_slice(&mut commit);

        Ok(Self { version, commit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_size() {
        assert_eq!(GREETING_SIZE, 49);
        assert_eq!(Greeting::current().encode().len(), GREETING_SIZE);
    }

    #[test]
    fn test_greeting_layout() {
        let greeting = Greeting::new("abc").unwrap();
        let bytes = greeting.encode();

        assert_eq!(&bytes[0..5], b"VMN3T");
        assert_eq!(&bytes[5..9], &22u32.to_le_bytes());
        assert_eq!(&bytes[9..12], b"abc");
        assert!(bytes[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_preserves_bytes() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"VMN3T");
        wire.extend_from_slice(&22u32.to_le_bytes());
        wire.extend_from_slice(&[b'7'; COMMIT_LENGTH]);

        let greeting = Greeting::decode(&wire).unwrap();
        assert_eq!(greeting.version(), 22);
        assert_eq!(greeting.commit(), "7".repeat(COMMIT_LENGTH));
        assert_eq!(greeting.encode(), wire);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut wire = Greeting::current().encode();
        wire[0] = b'X';

        let err = Greeting::decode(&wire).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMagic { .. }));
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let err = Greeting::decode(b"VMN3T").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                expected: GREETING_SIZE,
                got: 5
            }
        );
    }

    #[test]
    fn test_decode_accepts_other_version_but_ensure_rejects() {
        let greeting = Greeting::with_version(21, "old").unwrap();
        let decoded = Greeting::decode(&greeting.encode()).unwrap();

        assert_eq!(decoded.version(), 21);
        assert_eq!(
            decoded.ensure_supported().unwrap_err(),
            ProtocolError::UnsupportedVersion {
                expected: GREETING_VERSION,
                got: 21
            }
        );
    }

    #[test]
    fn test_commit_too_long() {
        let long = "x".repeat(COMMIT_LENGTH + 1);
        let err = Greeting::new(&long).unwrap_err();
        assert!(matches!(err, ProtocolError::CommitTooLong { len: 41, max: 40 }));
    }

    #[test]
    fn test_current_greeting_is_supported() {
        let greeting = Greeting::current();
        assert!(greeting.ensure_supported().is_ok());
        assert!(greeting.commit().starts_with("cfdevd-"));
    }
}
