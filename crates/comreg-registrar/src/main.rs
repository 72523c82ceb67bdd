//! Registrar worker process.
//!
//! Started by the launcher with `--pipe comreg.registrar-<id>`. Connects back
//! to the coordinator and registers one file per request inside its own
//! registry sandbox until `Terminate`.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use comreg_core::channel::MessageChannel;
use comreg_core::native::DllRegistrar;
use comreg_core::pipe::connect;
use comreg_core::registrar::RegistrarWorker;
use comreg_core::registry::Registry;
use comreg_core::settings::ComregSettings;
use comreg_core::{PipeName, PipeRole};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "comreg registrar worker", long_about = None)]
struct Cli {
    /// Pipe to connect back on
    #[arg(long)]
    pipe: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    comreg_core::logging::init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            warn!(error = %e.kind(), "ignoring invocation without a usable --pipe");
            return Ok(());
        }
    };
    let Some(pipe) = PipeName::parse(PipeRole::Registrar, &cli.pipe) else {
        warn!(pipe = %cli.pipe, "ignoring pipe name without the registrar prefix");
        return Ok(());
    };

    let settings = ComregSettings::load_default().unwrap_or_else(|e| {
        warn!(error = %e, "cannot load settings, using defaults");
        ComregSettings::default()
    });
    let output_root = settings.output_root()?;
    let worker = RegistrarWorker::new(system_registry(), Arc::new(DllRegistrar), &output_root);

    let stream = connect(&pipe, settings.timeouts.connect())
        .await
        .with_context(|| format!("cannot connect to {pipe}"))?;
    info!(pipe = %pipe, output_root = %output_root.display(), pid = std::process::id(), "registrar connected");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let mut channel = MessageChannel::new(stream);
    worker
        .serve(&mut channel, cancel)
        .await
        .context("registrar channel failed")?;
    info!("registrar exiting");
    Ok(())
}

#[cfg(windows)]
fn system_registry() -> Arc<dyn Registry> {
    Arc::new(comreg_core::registry::windows::WindowsRegistry::new())
}

/// No system registry here; the native call reports the platform as
/// unsupported, so every request still gets a well-formed failure.
#[cfg(not(windows))]
fn system_registry() -> Arc<dyn Registry> {
    Arc::new(comreg_core::registry::memory::MemoryRegistry::new())
}
