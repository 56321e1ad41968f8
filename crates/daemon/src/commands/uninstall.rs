//! Self-uninstall.

use std::sync::Arc;

use cfdevd_protocol::Uninstall;
use tokio::net::UnixStream;
use tracing::{info, warn};

use super::{write_success, Command, CommandFuture, ExecutionContext};

impl Command for Uninstall {
    fn name(&self) -> &'static str {
        "uninstall"
    }

    fn execute<'a>(
        self: Box<Self>,
        ctx: &'a ExecutionContext,
        stream: &'a mut UnixStream,
    ) -> CommandFuture<'a> {
        Box::pin(async move {
            let registrar = Arc::clone(&ctx.registrar);
            let spec = ctx.spec.clone();

            let removed = match tokio::task::spawn_blocking({
                let registrar = Arc::clone(&registrar);
                let spec = spec.clone();
                move || registrar.uninstall(&spec)
            })
            .await?
            {
                Ok(()) => {
                    info!(label = %spec.label, "Uninstalled");
                    true
                }
                Err(e) if e.is_not_found() => {
                    info!(label = %spec.label, "Already uninstalled");
                    false
                }
                Err(e) => return Err(e.into()),
            };

            write_success(stream).await?;

            // Stopping the service may end this process
            if removed {
                let label = spec.label.clone();
                match tokio::task::spawn_blocking(move || registrar.stop(&spec)).await? {
                    Ok(()) => {}
                    Err(e) => warn!(label = %label, "Failed to stop service: {}", e),
                }
            }
            Ok(())
        })
    }
}
