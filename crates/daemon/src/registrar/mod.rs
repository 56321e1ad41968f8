//! Registration of the daemon as a host-managed service.
//!
//! A [`DaemonSpec`] describes the service declaratively; a
//! [`ServiceRegistrar`] turns it into whatever the host's service manager
//! understands. Installing registers the service without starting it.
//! The running server never reads a `DaemonSpec`.

mod systemd;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Config;

pub use systemd::{
    generate_service_unit, generate_socket_unit, Systemctl, SystemdRegistrar, UnitManager,
};

/// Declarative description of the installed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSpec {
    /// Unique service label, also the unit name.
    pub label: String,
    /// Where the executable lives once installed.
    pub program: PathBuf,
    /// Arguments passed after the program path.
    pub program_arguments: Vec<String>,
    /// Start the service at boot instead of on first connection.
    pub run_at_load: bool,
    /// Activated sockets, by name.
    pub sockets: BTreeMap<String, PathBuf>,
    /// Standard output redirection.
    pub stdout_path: PathBuf,
    /// Standard error redirection.
    pub stderr_path: PathBuf,
}

impl DaemonSpec {
    /// Build the cfdevd service description from configuration.
    pub fn from_config(config: &Config) -> Self {
        let service = &config.service;

        let mut sockets = BTreeMap::new();
        sockets.insert(
            config.daemon.socket_name.clone(),
            service.socket_path.clone(),
        );

        Self {
            label: service.label.clone(),
            program: service.program.clone(),
            program_arguments: Vec::new(),
            run_at_load: false,
            sockets,
            stdout_path: service.stdout_path.clone(),
            stderr_path: service.stderr_path.clone(),
        }
    }
}

/// Errors reported by a [`ServiceRegistrar`].
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Nothing is registered under the label.
    #[error("service {label} is not installed")]
    NotFound { label: String },

    /// The `DaemonSpec` cannot be expressed by this service manager.
    #[error("invalid daemon spec: {0}")]
    InvalidSpec(String),

    /// A file operation failed.
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The service manager rejected a request.
    #[error("systemctl {args} failed: {stderr}")]
    Systemctl { args: String, stderr: String },

    /// The service manager's command-line tool is not installed.
    #[error("{tool} not found in PATH")]
    ToolMissing {
        tool: &'static str,
        #[source]
        source: which::Error,
    },
}

impl RegistrationError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error only says the service was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Installs and removes service registrations.
pub trait ServiceRegistrar: Send + Sync {
    /// Register `source` as a persistent service described by `spec`.
    ///
    /// The service is registered but not started.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable cannot be installed or the
    /// service manager rejects the registration.
    fn install(&self, spec: &DaemonSpec, source: &Path) -> Result<(), RegistrationError>;

    /// Remove the registration for `spec.label`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::NotFound`] if nothing is registered
    /// under the label.
    ///
    /// A running instance of the service is left alone; see
    /// [`ServiceRegistrar::stop`].
    fn uninstall(&self, spec: &DaemonSpec) -> Result<(), RegistrationError>;

    /// Ask the service manager to stop the service without waiting for it.
    ///
    /// When the caller is the service itself, this may be the last thing
    /// it does, so it runs after any response has been sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be queued.
    fn stop(&self, spec: &DaemonSpec) -> Result<(), RegistrationError>;

    /// Whether a registration exists for `spec.label`.
    fn is_installed(&self, spec: &DaemonSpec) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_default_config() {
        let spec = DaemonSpec::from_config(&Config::default());

        assert_eq!(spec.label, "org.cloudfoundry.cfdevd");
        assert!(!spec.run_at_load);
        assert!(spec.program_arguments.is_empty());
        assert_eq!(
            spec.sockets.get("ListenSocket"),
            Some(&PathBuf::from("/var/tmp/cfdevd.socket"))
        );
        assert_eq!(spec.stdout_path, PathBuf::from("/var/tmp/cfdevd.stdout.log"));
        assert_eq!(spec.stderr_path, PathBuf::from("/var/tmp/cfdevd.stderr.log"));
    }

    #[test]
    fn test_spec_follows_socket_name() {
        let mut config = Config::default();
        config.daemon.socket_name = "HelperSocket".to_string();

        let spec = DaemonSpec::from_config(&config);
        assert_eq!(spec.sockets.keys().collect::<Vec<_>>(), vec!["HelperSocket"]);
    }

    #[test]
    fn test_not_found_display() {
        let err = RegistrationError::NotFound {
            label: "org.cloudfoundry.cfdevd".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "service org.cloudfoundry.cfdevd is not installed");
    }
}
