//! Error types for the protocol crate.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Protocol error type covering every way a wire message can be malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Handshake errors
    /// The greeting did not start with the expected magic bytes.
    #[error("invalid greeting magic: expected {expected:02x?}, got {got:02x?}")]
    InvalidMagic {
        /// Expected magic value.
        expected: [u8; 5],
        /// Actual magic value received.
        got: [u8; 5],
    },

    /// The peer speaks a protocol version this build does not support.
    #[error("unsupported protocol version: expected {expected}, got {got}")]
    UnsupportedVersion {
        /// Version supported by this build.
        expected: u32,
        /// Version announced by the peer.
        got: u32,
    },

    /// A commit identifier does not fit into the greeting.
    #[error("commit identifier too long: {len} bytes exceeds maximum of {max} bytes")]
    CommitTooLong {
        /// Length of the rejected identifier.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    // Frame errors
    /// Fewer (or more) bytes than the message layout requires.
    #[error("malformed message: expected {expected} bytes, got {got}")]
    Truncated {
        /// Number of bytes the layout requires.
        expected: usize,
        /// Number of bytes available.
        got: usize,
    },

    /// The discriminator byte does not name a known command.
    #[error("unknown command discriminator: {0:#04x}")]
    UnknownCommand(u8),

    /// The frame carries a different command than the one being decoded.
    #[error("command discriminator mismatch: expected {expected:#04x}, got {got:#04x}")]
    DiscriminatorMismatch {
        /// Discriminator of the command type being decoded.
        expected: u8,
        /// Discriminator found in the frame.
        got: u8,
    },

    /// A netmask whose set bits are not contiguous.
    #[error("invalid netmask: {0}")]
    InvalidNetmask(Ipv4Addr),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
