//! Loopback address aliases.
//!
//! The commands themselves only validate and log; the actual interface
//! change goes through a [`NetworkConfigurator`].

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::process::ExitStatus;

use cfdevd_protocol::{prefix_len, AddIpAlias, RemoveIpAlias};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::process::Command as Process;
use tracing::{debug, info};

use super::{write_success, Command, CommandFuture, ExecutionContext};
use crate::activation::ACTIVATION_ENV;

/// Future returned by [`NetworkConfigurator`] methods.
pub type NetworkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NetworkError>> + Send + 'a>>;

/// Errors from reconfiguring an interface.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The platform tool is not installed.
    #[error("{tool} not found in PATH")]
    ToolMissing {
        tool: &'static str,
        #[source]
        source: which::Error,
    },

    /// The platform tool could not be started.
    #[error("failed to run {tool}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    /// The platform tool reported failure.
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Adds and removes address aliases on the loopback interface.
pub trait NetworkConfigurator: Send + Sync {
    /// Add `address` with `netmask` as an alias.
    fn add_alias<'a>(&'a self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetworkFuture<'a>;

    /// Remove the alias `address`.
    fn remove_alias<'a>(&'a self, address: Ipv4Addr) -> NetworkFuture<'a>;
}

/// Shells out to `ip` on Linux and `ifconfig` on macOS.
#[derive(Debug, Clone)]
pub struct SystemNetworkConfigurator {
    interface: String,
}

impl SystemNetworkConfigurator {
    /// Manage aliases on `interface`.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    /// The managed interface.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn add_alias_command(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            (
                "ifconfig",
                vec![
                    self.interface.clone(),
                    "alias".to_string(),
                    address.to_string(),
                    netmask.to_string(),
                ],
            )
        } else {
            let prefix = prefix_len(netmask).unwrap_or(32);
            (
                "ip",
                vec![
                    "addr".to_string(),
                    "add".to_string(),
                    format!("{address}/{prefix}"),
                    "dev".to_string(),
                    self.interface.clone(),
                ],
            )
        }
    }

    fn remove_alias_command(&self, address: Ipv4Addr) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            (
                "ifconfig",
                vec![
                    self.interface.clone(),
                    "-alias".to_string(),
                    address.to_string(),
                ],
            )
        } else {
            (
                "ip",
                vec![
                    "addr".to_string(),
                    "del".to_string(),
                    format!("{address}/32"),
                    "dev".to_string(),
                    self.interface.clone(),
                ],
            )
        }
    }

    async fn run(tool: &'static str, args: Vec<String>) -> Result<(), NetworkError> {
        let path = which::which(tool).map_err(|source| NetworkError::ToolMissing { tool, source })?;
        let command = format!("{} {}", tool, args.join(" "));
        debug!("Running {}", command);

        let mut process = Process::new(path);
        process.args(&args);
        for var in ACTIVATION_ENV {
            process.env_remove(var);
        }
        let output = process
            .output()
            .await
            .map_err(|source| NetworkError::Spawn { tool, source })?;

        if !output.status.success() {
            return Err(NetworkError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl NetworkConfigurator for SystemNetworkConfigurator {
    fn add_alias<'a>(&'a self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetworkFuture<'a> {
        let (tool, args) = self.add_alias_command(address, netmask);
        Box::pin(Self::run(tool, args))
    }

    fn remove_alias<'a>(&'a self, address: Ipv4Addr) -> NetworkFuture<'a> {
        let (tool, args) = self.remove_alias_command(address);
        Box::pin(Self::run(tool, args))
    }
}

impl Command for AddIpAlias {
    fn name(&self) -> &'static str {
        "add-ip-alias"
    }

    fn execute<'a>(
        self: Box<Self>,
        ctx: &'a ExecutionContext,
        stream: &'a mut UnixStream,
    ) -> CommandFuture<'a> {
        Box::pin(async move {
            info!(address = %self.address, prefix = self.prefix_len(), "Adding loopback alias");
            ctx.network.add_alias(self.address, self.netmask).await?;
            write_success(stream).await
        })
    }
}

impl Command for RemoveIpAlias {
    fn name(&self) -> &'static str {
        "remove-ip-alias"
    }

    fn execute<'a>(
        self: Box<Self>,
        ctx: &'a ExecutionContext,
        stream: &'a mut UnixStream,
    ) -> CommandFuture<'a> {
        Box::pin(async move {
            info!(address = %self.address, "Removing loopback alias");
            ctx.network.remove_alias(self.address).await?;
            write_success(stream).await
        })
    }
}
