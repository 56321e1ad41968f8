//! Unix domain socket transport between clients and the daemon.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!  client                                   daemon
//!    │ ── greeting (49 bytes) ─────────────► │  authenticate
//!    │ ◄──────────────── greeting (49 bytes) │
//!    │ ── id byte + payload ───────────────► │  decode
//!    │                                       │  execute
//!    │ ◄────────────────────── 0x00 marker ─ │
//!    │                 close                 │
//! ```
//!
//! Any failure on the daemon side closes the connection without writing
//! anything further.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use std::path::Path;
//!
//! use cfdevd::ipc::DaemonClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DaemonClient::connect(Path::new("/var/tmp/cfdevd.socket")).await?;
//!     client
//!         .add_ip_alias(Ipv4Addr::new(10, 144, 0, 34), Ipv4Addr::BROADCAST)
//!         .await?;
//!     Ok(())
//! }
//! ```

mod client;
mod server;

pub use client::{ClientError, DaemonClient};
pub use server::{ConnectionError, ConnectionHandler, ConnectionServer};
