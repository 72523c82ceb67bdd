//! Registrar worker: registers one file at a time inside a virtualization
//! scope and persists the captured delta under the output root.

use crate::channel::MessageChannel;
use crate::error::ChannelError;
use crate::file_record::FileRecord;
use crate::message::{Message, RegistrationResult};
use crate::native::NativeRegistrar;
use crate::paths::RegistrationLayout;
use crate::registry::{hive, Registry, VirtualizationScope};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct RegistrarWorker {
    registry: Arc<dyn Registry>,
    native: Arc<dyn NativeRegistrar>,
    output_root: PathBuf,
}

impl RegistrarWorker {
    pub fn new(
        registry: Arc<dyn Registry>,
        native: Arc<dyn NativeRegistrar>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            native,
            output_root: output_root.into(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Registers `path` and reports the outcome. Never fails as a whole:
    /// every error becomes a [`RegistrationResult::Failure`].
    pub fn register_one(&self, file: &FileRecord, path: &Path, sha256: &str) -> RegistrationResult {
        match self.capture(file, path, sha256) {
            Ok(output_path) => {
                info!(path = %path.display(), output = %output_path.display(), "registered");
                RegistrationResult::Success {
                    file: file.clone(),
                    output_path,
                    name: file_name(path),
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "registration failed");
                RegistrationResult::failure(path, format!("registration failed: {e:#}"))
            }
        }
    }

    fn capture(&self, file: &FileRecord, path: &Path, sha256: &str) -> Result<PathBuf> {
        let layout = RegistrationLayout::new(&self.output_root, sha256)?;

        let mut scope = VirtualizationScope::open(self.registry.clone())
            .context("cannot open registry sandbox")?;
        let registered = self.native.register(path);
        // Overrides must be gone before the private root can be exported.
        scope.close();
        registered?;

        hive::save(self.registry.as_ref(), scope.path(), &layout.hive_path())
            .context("hive export failed")?;
        let sidecar = serde_json::to_vec_pretty(file)?;
        std::fs::write(layout.sidecar_path(), sidecar).context("sidecar write failed")?;
        scope.discard();
        Ok(layout.dir().to_path_buf())
    }

    /// Answers registration requests until `Terminate`, peer closure or
    /// cancellation.
    pub async fn serve<S>(
        &self,
        channel: &mut MessageChannel<S>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("registrar cancelled");
                    return Ok(());
                }
                read = channel.read() => match read {
                    Ok(message) => message,
                    Err(e) if e.is_closed() => {
                        debug!("coordinator closed the channel");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            };

            match message {
                Message::RegistrationRequest { file, path, sha256 } => {
                    let worker = self.clone();
                    let request_path = path.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        worker.register_one(&file, &path, &sha256)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        RegistrationResult::failure(
                            &request_path,
                            format!("registration task aborted: {e}"),
                        )
                    });
                    channel.write(&Message::RegistrationResult(result)).await?;
                }
                Message::Terminate => {
                    debug!("terminate received");
                    return Ok(());
                }
                other => warn!(kind = other.kind(), "ignoring unexpected message"),
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
