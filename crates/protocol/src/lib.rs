//! # cfdevd Protocol Library
//!
//! Wire formats spoken on the cfdevd socket, shared by the daemon and its
//! clients. Everything here is a pure codec: no sockets, no async.
//!
//! ## Connection Layout
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Command-specific request/response   │  e.g. success marker
//! ├─────────────────────────────────────────┤
//! │            Command frame                │  discriminator + payload
//! ├─────────────────────────────────────────┤
//! │         Greeting handshake              │  49 bytes each way
//! ├─────────────────────────────────────────┤
//! │        Unix domain stream socket        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::net::Ipv4Addr;
//!
//! use cfdevd_protocol::{AddIpAlias, Greeting, WireCommand};
//!
//! let hello = Greeting::current().encode();
//! assert_eq!(hello.len(), cfdevd_protocol::GREETING_SIZE);
//!
//! let cmd = AddIpAlias::new(Ipv4Addr::new(10, 144, 0, 34), Ipv4Addr::BROADCAST).unwrap();
//! let frame = cmd.encode_frame();
//! assert_eq!(AddIpAlias::decode_frame(&frame).unwrap(), cmd);
//! ```
//!
//! ## Modules
//!
//! - [`handshake`]: Greeting exchanged before any command
//! - [`framing`]: Command frames and the success marker
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod handshake;

pub use error::{ProtocolError, Result};
pub use framing::{
    prefix_len, AddIpAlias, RemoveIpAlias, Uninstall, WireCommand, ADD_IP_ALIAS_ID,
    REMOVE_IP_ALIAS_ID, SUCCESS_MARKER, UNINSTALL_ID,
};
pub use handshake::{Greeting, COMMIT_LENGTH, GREETING_MAGIC, GREETING_SIZE, GREETING_VERSION};
