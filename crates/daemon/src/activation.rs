//! Listener acquisition through socket activation.
//!
//! The daemon never binds its socket path. The service manager binds it,
//! hands the descriptor over on exec and names it; this module claims the
//! descriptor by name, checks that it really is a Unix stream listener and
//! turns it into a tokio listener.
//!
//! ## systemd protocol
//!
//! ```text
//! LISTEN_PID=<pid the descriptors are meant for>
//! LISTEN_FDS=<count>            descriptors 3 .. 3+count
//! LISTEN_FDNAMES=a:b:c          one name per descriptor
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use cfdevd::activation::{acquire_listener, SystemdActivation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = acquire_listener(&mut SystemdActivation::new(), "ListenSocket")?;
//!     let (_stream, _addr) = listener.accept().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::env;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockopt, sockopt, SockType};
use thiserror::Error;
use tokio::net::UnixListener;
use tracing::{debug, info};

/// First descriptor passed by systemd.
pub const LISTEN_FDS_START: RawFd = 3;

/// Name systemd gives descriptors when the unit sets none.
const UNNAMED_FD: &str = "unknown";

/// Upper bound on `LISTEN_FDS`; systemd itself refuses more.
const MAX_LISTEN_FDS: usize = 4096;

/// Activation variables, kept away from spawned tools.
pub const ACTIVATION_ENV: [&str; 3] = ["LISTEN_PID", "LISTEN_FDS", "LISTEN_FDNAMES"];

/// Set once the activated descriptors have been wrapped in `OwnedFd`s.
static SYSTEMD_FDS_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Errors that make the daemon unable to serve. All of them are fatal.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The activation mechanism provided nothing under the name.
    #[error("no activated listener named {name:?}")]
    NoListeners { name: String },

    /// More than one descriptor shares the name.
    #[error("expected exactly one activated listener named {name:?}, got {count}")]
    TooManyListeners { name: String, count: usize },

    /// The descriptor is not a listening Unix stream socket.
    #[error("activated socket is not a unix stream listener: {0}")]
    WrongKind(String),

    /// Reading the activation state or converting the descriptor failed.
    #[error("failed to acquire activated listener")]
    Io(#[source] io::Error),
}

/// A provider of pre-bound sockets, looked up by name.
pub trait ActivationSource {
    /// Take ownership of every descriptor registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the activation state is malformed or the
    /// descriptors were already claimed.
    fn take_listeners(&mut self, name: &str) -> io::Result<Vec<OwnedFd>>;
}

/// Descriptors handed over by systemd socket activation.
#[derive(Debug, Default)]
pub struct SystemdActivation;

impl SystemdActivation {
    /// Create a source reading the `LISTEN_*` environment.
    pub fn new() -> Self {
        Self
    }
}

impl ActivationSource for SystemdActivation {
    fn take_listeners(&mut self, name: &str) -> io::Result<Vec<OwnedFd>> {
        let activated = activated_fds(
            env::var("LISTEN_PID").ok().as_deref(),
            env::var("LISTEN_FDS").ok().as_deref(),
            env::var("LISTEN_FDNAMES").ok().as_deref(),
            std::process::id(),
        )?;

        if SYSTEMD_FDS_CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "activated descriptors were already claimed",
            ));
        }

        debug!(count = activated.len(), "Found activated descriptors");

        // SAFETY: systemd passes these descriptors open to this pid, and the
        // claimed flag guarantees each one is wrapped at most once.
        unsafe { claim_activated(activated, name) }
    }
}

/// Take ownership of `activated`, keeping the ones named `name`.
///
/// Every descriptor is marked close-on-exec; the others are closed.
///
/// # Safety
///
/// Each descriptor must be open and owned by nobody else.
unsafe fn claim_activated(
    activated: Vec<(RawFd, String)>,
    name: &str,
) -> io::Result<Vec<OwnedFd>> {
    let mut owned = Vec::new();
    for (fd, fd_name) in activated {
        let fd = OwnedFd::from_raw_fd(fd);
        set_cloexec(&fd)?;
        if fd_name == name {
            owned.push(fd);
        } else {
            debug!(fd = fd.as_raw_fd(), name = %fd_name, "Closing unrequested descriptor");
        }
    }
    Ok(owned)
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Parse the `LISTEN_*` variables into `(fd, name)` pairs.
///
/// Descriptors meant for another process are ignored.
fn activated_fds(
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    listen_fdnames: Option<&str>,
    own_pid: u32,
) -> io::Result<Vec<(RawFd, String)>> {
    let Some(listen_pid) = listen_pid else {
        return Ok(Vec::new());
    };
    let target: u32 = listen_pid
        .trim()
        .parse()
        .map_err(|_| invalid_env("LISTEN_PID", listen_pid))?;
    if target != own_pid {
        debug!(target, own_pid, "Activated descriptors belong to another process");
        return Ok(Vec::new());
    }

    let count: usize = match listen_fds {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| invalid_env("LISTEN_FDS", value))?,
        None => 0,
    };
    if count > MAX_LISTEN_FDS {
        return Err(invalid_env("LISTEN_FDS", &count.to_string()));
    }

    let names: Vec<&str> = listen_fdnames
        .map(|names| names.split(':').collect())
        .unwrap_or_default();

    Ok((0..count)
        .map(|i| {
            let name = names.get(i).copied().unwrap_or(UNNAMED_FD);
            (LISTEN_FDS_START + i as RawFd, name.to_string())
        })
        .collect())
}

fn invalid_env(var: &str, value: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid {var} value: {value:?}"),
    )
}

/// In-memory activation source, filled by hand.
///
/// Useful wherever the listener is bound by the caller itself, such as tests
/// or running the daemon outside a service manager.
#[derive(Debug, Default)]
pub struct InMemoryActivation {
    sockets: HashMap<String, Vec<OwnedFd>>,
}

impl InMemoryActivation {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under `name`.
    pub fn with_socket(mut self, name: &str, fd: impl Into<OwnedFd>) -> Self {
        self.sockets
            .entry(name.to_string())
            .or_default()
            .push(fd.into());
        self
    }
}

impl ActivationSource for InMemoryActivation {
    fn take_listeners(&mut self, name: &str) -> io::Result<Vec<OwnedFd>> {
        Ok(self.sockets.remove(name).unwrap_or_default())
    }
}

/// Look up the listener named `name` and convert it into a tokio listener.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error unless exactly one descriptor is registered under
/// `name` and it is a listening `AF_UNIX`/`SOCK_STREAM` socket.
pub fn acquire_listener<S>(source: &mut S, name: &str) -> Result<UnixListener, ListenerError>
where
    S: ActivationSource + ?Sized,
{
    let mut fds = source.take_listeners(name).map_err(ListenerError::Io)?;

    let fd = match fds.len() {
        0 => {
            return Err(ListenerError::NoListeners {
                name: name.to_string(),
            })
        }
        1 => fds.remove(0),
        count => {
            return Err(ListenerError::TooManyListeners {
                name: name.to_string(),
                count,
            })
        }
    };

    check_stream_listener(&fd)?;
    set_cloexec(&fd).map_err(ListenerError::Io)?;

    let listener = StdUnixListener::from(fd);
    // getsockname fails the AF_UNIX family check for any other domain
    let local_addr = listener
        .local_addr()
        .map_err(|e| ListenerError::WrongKind(e.to_string()))?;
    listener.set_nonblocking(true).map_err(ListenerError::Io)?;

    let listener = UnixListener::from_std(listener).map_err(ListenerError::Io)?;

    info!(name, addr = ?local_addr, "Acquired activated listener");
    Ok(listener)
}

fn check_stream_listener(fd: &OwnedFd) -> Result<(), ListenerError> {
    let kind = getsockopt(fd, sockopt::SockType)
        .map_err(|e| ListenerError::Io(io::Error::from(e)))?;
    if kind != SockType::Stream {
        return Err(ListenerError::WrongKind(format!(
            "socket type is {kind:?}, expected Stream"
        )));
    }

    let listening = getsockopt(fd, sockopt::AcceptConn)
        .map_err(|e| ListenerError::Io(io::Error::from(e)))?;
    if !listening {
        return Err(ListenerError::WrongKind(
            "socket is not listening".to_string(),
        ));
    }

    Ok(())
}
