//! Coordinator side of the supervisor channel.

use crate::error::CoordinatorError;
use crate::host::{reap, HelperHost, HelperProcess};
use comreg_core::elevation::EXIT_ELEVATION_CANCELLED;
use comreg_core::pipe::{PipeListener, ServerStream};
use comreg_core::settings::TimeoutSettings;
use comreg_core::{ExtractorKind, Message, MessageChannel, PipeName, PipeRole};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connected supervisor. Worker-creation requests go through one mutex so a
/// request and its reply are never interleaved with another's.
pub struct SupervisorLink {
    channel: Mutex<Option<MessageChannel<ServerStream>>>,
    launcher: Mutex<Option<Box<dyn HelperProcess>>>,
    timeouts: TimeoutSettings,
    closed: AtomicBool,
}

impl SupervisorLink {
    /// Creates the supervisor pipe, starts the launcher and waits for the
    /// elevated supervisor to connect.
    ///
    /// The launcher exiting with `1223` means the user declined elevation.
    /// A clean exit means it relaunched itself elevated, so the wait goes on
    /// for the elevated copy.
    pub async fn connect(
        host: &dyn HelperHost,
        timeouts: TimeoutSettings,
        cancel: &CancellationToken,
    ) -> Result<Self, CoordinatorError> {
        let name = PipeName::new(PipeRole::ProcessLauncher);
        let mut listener = PipeListener::bind(&name)?;
        let mut launcher = host
            .launch_supervisor(&name)
            .await
            .map_err(CoordinatorError::LauncherFailed)?;

        let accepted = {
            let accept = listener.accept();
            tokio::pin!(accept);
            let deadline = tokio::time::sleep(timeouts.connect());
            tokio::pin!(deadline);
            let mut launcher_exited = false;

            loop {
                tokio::select! {
                    stream = &mut accept => break stream.map_err(CoordinatorError::from),
                    status = launcher.wait(), if !launcher_exited => match status {
                        Ok(Some(0)) => {
                            debug!(pipe = %name, "launcher handed over to an elevated copy");
                            launcher_exited = true;
                        }
                        Ok(Some(code)) if code == EXIT_ELEVATION_CANCELLED => {
                            break Err(CoordinatorError::ElevationCancelled);
                        }
                        Ok(code) => break Err(CoordinatorError::LauncherExited(code)),
                        Err(e) => break Err(CoordinatorError::Io(e)),
                    },
                    _ = &mut deadline => {
                        break Err(CoordinatorError::ConnectTimeout("supervisor", timeouts.connect()));
                    }
                    _ = cancel.cancelled() => break Err(CoordinatorError::Cancelled),
                }
            }
        };

        match accepted {
            Ok(stream) => {
                info!(pipe = %name, "supervisor connected");
                Ok(Self {
                    channel: Mutex::new(Some(MessageChannel::new(stream))),
                    launcher: Mutex::new(Some(launcher)),
                    timeouts,
                    closed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                warn!(pipe = %name, error = %e, "supervisor connect failed");
                reap(launcher.as_mut(), &timeouts).await;
                Err(e)
            }
        }
    }

    /// Asks the supervisor to start a registrar bound to `pipe` and returns
    /// its process id.
    pub async fn start_registrar(
        &self,
        pipe: &PipeName,
        cancel: &CancellationToken,
    ) -> Result<u32, CoordinatorError> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or(CoordinatorError::Cancelled)?;
        let request = Message::StartRegistrarRequest {
            extractor_kind: ExtractorKind::Library,
            pipe_name: pipe.as_str().to_string(),
        };
        let reply = tokio::select! {
            reply = async {
                channel.write(&request).await?;
                channel.read().await
            } => reply?,
            _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
        };
        match reply {
            Message::StartRegistrarResult {
                process_id: Some(pid),
                ..
            } => {
                debug!(pipe = %pipe, pid, "registrar started");
                Ok(pid)
            }
            Message::StartRegistrarResult {
                process_id: None,
                error,
            } => Err(CoordinatorError::WorkerSpawn(
                error.unwrap_or_else(|| "supervisor reported no process".to_string()),
            )),
            other => Err(CoordinatorError::UnexpectedMessage(other.kind())),
        }
    }

    /// Sends `Terminate`, allows the grace period, then kills the launcher
    /// if it is still around. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut channel) = self.channel.lock().await.take() {
            if channel.is_usable() {
                if let Err(e) = channel.write(&Message::Terminate).await {
                    debug!(error = %e, "supervisor already gone");
                }
            }
        }
        if let Some(mut launcher) = self.launcher.lock().await.take() {
            reap(launcher.as_mut(), &self.timeouts).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
