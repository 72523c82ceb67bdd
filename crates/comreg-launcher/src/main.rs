//! Elevated process launcher.
//!
//! Started by the coordinator with `--pipe comreg.processlauncher-<id>`.
//! An unelevated start relaunches itself through the elevation prompt and
//! exits with the outcome; the elevated copy connects back and spawns one
//! registrar per request until told to stop.
//!
//! The coordinator never learns the elevated copy's process id. That copy is
//! bounded by the supervisor channel alone: `Terminate` or the channel
//! closing ends `serve`, after which its registrars are reaped.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use comreg_core::channel::MessageChannel;
use comreg_core::elevation::{hide_console, relaunch_elevated, StartupPhase};
use comreg_core::pipe::connect;
use comreg_core::settings::ComregSettings;
use comreg_core::supervisor::{self, ProcessSpawner};
use comreg_core::{PipeName, PipeRole};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "comreg elevated process launcher", long_about = None)]
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
    let Some(pipe) = PipeName::parse(PipeRole::ProcessLauncher, &cli.pipe) else {
        warn!(pipe = %cli.pipe, "ignoring pipe name without the launcher prefix");
        return Ok(());
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let phase = StartupPhase::detect().advance(|| relaunch_elevated(&args));
    if let Some(code) = phase.exit_code() {
        std::process::exit(code);
    }

    hide_console();
    run(pipe).await
}

async fn run(pipe: PipeName) -> Result<()> {
    let settings = ComregSettings::load_default().unwrap_or_else(|e| {
        warn!(error = %e, "cannot load settings, using defaults");
        ComregSettings::default()
    });
    let registrar = settings.registrar_path()?;
    let spawner = ProcessSpawner::new(&registrar);

    let stream = connect(&pipe, settings.timeouts.connect())
        .await
        .with_context(|| format!("cannot connect to {pipe}"))?;
    info!(pipe = %pipe, registrar = %registrar.display(), "connected to coordinator");

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
    let served = supervisor::serve(&mut channel, &spawner, cancel).await;
    spawner.shutdown(settings.timeouts.terminate_grace()).await;
    served.context("supervisor channel failed")?;
    info!("launcher exiting");
    Ok(())
}
