//! Service manager readiness notifications (sd_notify).
//!
//! Every function here is a no-op when `NOTIFY_SOCKET` is unset, so the
//! daemon can call them unconditionally.
//!
//! ```rust,no_run
//! use cfdevd::notify::{notify_ready, notify_stopping};
//!
//! notify_ready();
//! // ... serve ...
//! notify_stopping();
//! ```

use std::env;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

/// Environment variable name for the systemd notification socket.
const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Check if a service manager expects notifications from this process.
pub fn is_systemd() -> bool {
    env::var(NOTIFY_SOCKET_ENV).is_ok()
}

/// Where notifications are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NotifyTarget {
    /// A socket file.
    Path(PathBuf),
    /// A Linux abstract socket, written `@name` in the environment.
    Abstract(String),
}

impl NotifyTarget {
    /// Parse a `NOTIFY_SOCKET` value.
    fn parse(value: &str) -> Option<Self> {
        match value.strip_prefix('@') {
            Some("") => None,
            Some(name) => Some(Self::Abstract(name.to_string())),
            None if value.starts_with('/') => Some(Self::Path(PathBuf::from(value))),
            None => None,
        }
    }

    fn send(&self, socket: &UnixDatagram, message: &[u8]) -> io::Result<usize> {
        match self {
            Self::Path(path) => socket.send_to(message, path),
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                socket.send_to_addr(message, &addr)
            }
            #[cfg(not(target_os = "linux"))]
            Self::Abstract(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "abstract sockets are Linux only",
            )),
        }
    }
}

/// Read the notification target from the environment.
fn notify_target() -> Option<NotifyTarget> {
    let value = env::var(NOTIFY_SOCKET_ENV).ok()?;
    let target = NotifyTarget::parse(&value);
    if target.is_none() {
        warn!("Ignoring invalid {}: {}", NOTIFY_SOCKET_ENV, value);
    }
    target
}

/// Send a raw `KEY=VALUE\n` notification.
///
/// # Errors
///
/// Returns an error if the datagram cannot be sent.
fn notify(message: &str) -> io::Result<()> {
    let Some(target) = notify_target() else {
        debug!("No service manager to notify");
        return Ok(());
    };

    let socket = UnixDatagram::unbound()?;
    target.send(&socket, message.as_bytes())?;

    debug!("Sent notification: {}", message.trim());
    Ok(())
}

/// Report that the listener is acquired and connections are being served.
pub fn notify_ready() {
    if let Err(e) = notify("READY=1\n") {
        error!("Failed to notify systemd of ready state: {}", e);
    } else if is_systemd() {
        info!("Notified systemd: service ready");
    }
}

/// Publish a human-readable status line for `systemctl status`.
pub fn notify_status(message: &str) {
    let notification = format!("STATUS={}\n", message);
    if let Err(e) = notify(&notification) {
        error!("Failed to notify systemd of status: {}", e);
    }
}

/// Report that shutdown has begun.
pub fn notify_stopping() {
    if let Err(e) = notify("STOPPING=1\n") {
        error!("Failed to notify systemd of stopping state: {}", e);
    } else if is_systemd() {
        info!("Notified systemd: service stopping");
    }
}
