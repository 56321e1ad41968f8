//! cfdevd
//!
//! Privileged helper serving one command per connection on an activated
//! Unix socket.

use std::path::PathBuf;

use anyhow::Context;
use cfdevd::activation::SystemdActivation;
use cfdevd::config::{Config, ShutdownMode};
use cfdevd::orchestrator::DaemonOrchestrator;
use cfdevd::registrar::{DaemonSpec, ServiceRegistrar, SystemdRegistrar};
use cfdevd::signals::SignalWatcher;
use clap::{Parser, Subcommand};

/// cfdevd - privileged helper daemon.
#[derive(Parser, Debug)]
#[command(name = "cfdevd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute; serves connections when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Register this executable as a socket-activated service (not started)
    Install,

    /// Remove the service registration
    Uninstall,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("CFDEVD_LOG_LEVEL")
            .ok()
            .filter(|level| !level.is_empty())
            .unwrap_or_else(|| config.daemon.log_level.clone())
            .to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level.as_str()).init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    match cli.command {
        None => serve(config).await,
        Some(Commands::Install) => install(&config),
        Some(Commands::Uninstall) => uninstall(&config),
    }
}

/// Serve connections until a shutdown signal arrives.
async fn serve(config: Config) -> anyhow::Result<()> {
    let orchestrator = DaemonOrchestrator::new(config);

    SignalWatcher::register()
        .context("Failed to register signal handlers")?
        .spawn(orchestrator.shutdown_token());

    let report = orchestrator
        .run(&mut SystemdActivation::new())
        .await
        .context("Failed to acquire listener")?;

    if report.mode == ShutdownMode::Abrupt {
        // In-flight handlers are abandoned rather than awaited
        std::process::exit(0);
    }
    Ok(())
}

/// Register the running executable as a service.
fn install(config: &Config) -> anyhow::Result<()> {
    let source = std::env::current_exe().context("Failed to locate the running executable")?;
    let spec = DaemonSpec::from_config(config);
    let registrar = SystemdRegistrar::from_config(&config.service);

    registrar
        .install(&spec, &source)
        .with_context(|| format!("Failed to install {}", spec.label))?;

    println!("Installed {}", spec.label);
    Ok(())
}

/// Remove the service registration.
fn uninstall(config: &Config) -> anyhow::Result<()> {
    let spec = DaemonSpec::from_config(config);
    let registrar = SystemdRegistrar::from_config(&config.service);

    match registrar.uninstall(&spec) {
        Ok(()) => println!("Uninstalled {}", spec.label),
        Err(e) if e.is_not_found() => {
            println!("{} is not installed", spec.label);
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to uninstall {}", spec.label));
        }
    }

    registrar
        .stop(&spec)
        .with_context(|| format!("Failed to stop {}", spec.label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_serves() {
        let cli = Cli::try_parse_from(["cfdevd"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_subcommands_with_global_flags() {
        let cli = Cli::try_parse_from(["cfdevd", "install", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Install));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));

        let cli = Cli::try_parse_from(["cfdevd", "-v", "uninstall"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Uninstall));
        assert!(cli.verbose);
    }

    #[test]
    fn test_unknown_argument_rejected() {
        assert!(Cli::try_parse_from(["cfdevd", "bogus"]).is_err());
    }
}
