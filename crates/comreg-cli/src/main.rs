use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use comreg_core::settings::{ComregSettings, OUTPUT_ROOT_ENV};
use comreg_core::RegistrationResult;
use comreg_engine::{Coordinator, ManifestClassifier, OsHost};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "comreg")]
#[command(author, version, about = "Sandboxed COM library registration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register libraries in a registry sandbox and capture what they write
    Register {
        /// JSON array of classified file records
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Where captured hives are written
        #[arg(long)]
        output_root: Option<PathBuf>,
        /// Print one JSON object per result
        #[arg(long)]
        json: bool,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the effective settings
    Settings {
        #[arg(long)]
        output_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    comreg_core::logging::init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Register {
            manifest,
            output_root,
            json,
            paths,
        } => register_command(manifest, output_root, json, paths).await,
        Commands::Settings { output_root } => settings_command(output_root),
    }
}

fn load_settings(output_root: Option<PathBuf>) -> Result<ComregSettings> {
    let mut settings = ComregSettings::load_default().context("cannot load settings")?;
    if output_root.is_some() {
        settings.output_root = output_root;
    }
    Ok(settings)
}

async fn register_command(
    manifest: Option<PathBuf>,
    output_root: Option<PathBuf>,
    json: bool,
    paths: Vec<PathBuf>,
) -> Result<()> {
    let settings = load_settings(output_root)?;
    let classifier = match manifest {
        Some(path) => ManifestClassifier::load(&path)?,
        None => ManifestClassifier::default(),
    };
    if classifier.is_empty() {
        warn!("no classified files; every path will be reported ineligible");
    }

    let output_root = settings.output_root()?;
    let host = OsHost::new(settings.launcher_path()?).with_env(OUTPUT_ROOT_ENV, output_root);
    let coordinator = Coordinator::new(
        Arc::new(host),
        Arc::new(classifier),
        settings.timeouts.clone(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling registration");
                cancel.cancel();
            }
        }
    });

    let mut stream = coordinator.register(paths, &cancel);
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut fatal = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(result) => {
                if result.is_success() {
                    succeeded += 1;
                } else {
                    failed += 1;
                }
                print_result(&result, json)?;
            }
            Err(e) => fatal = Some(e),
        }
    }
    stream.close().await;
    info!(succeeded, failed, "registration finished");

    if let Some(e) = fatal {
        if e.is_elevation_cancelled() {
            return Err(anyhow!("elevation was declined; nothing was registered"));
        }
        return Err(e).context("registration batch failed");
    }
    if cancel.is_cancelled() {
        return Err(anyhow!("registration cancelled"));
    }
    Ok(())
}

fn print_result(result: &RegistrationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    match result {
        RegistrationResult::Success {
            name, output_path, ..
        } => println!("ok      {name} -> {}", output_path.display()),
        RegistrationResult::Failure { name, error, .. } => println!("failed  {name}: {error}"),
    }
    Ok(())
}

fn settings_command(output_root: Option<PathBuf>) -> Result<()> {
    let settings = load_settings(output_root)?;
    let settings_path = comreg_core::paths::settings_path()?;
    let output_root = settings.output_root()?;
    let launcher_path = settings.launcher_path()?;
    let registrar_path = settings.registrar_path()?;
    let effective = serde_json::json!({
        "settings_path": settings_path,
        "output_root": output_root,
        "launcher_path": launcher_path,
        "registrar_path": registrar_path,
        "timeouts": settings.timeouts,
    });
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}
