//! One registrar worker and the data channel to it.

use crate::error::CoordinatorError;
use crate::host::{reap, HelperHost, HelperProcess};
use crate::link::SupervisorLink;
use comreg_core::pipe::{PipeListener, ServerStream};
use comreg_core::settings::TimeoutSettings;
use comreg_core::{FileRecord, Message, MessageChannel, PipeName, PipeRole, RegistrationResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct WorkerSession {
    pipe: PipeName,
    pid: u32,
    channel: MessageChannel<ServerStream>,
    process: Option<Box<dyn HelperProcess>>,
    timeouts: TimeoutSettings,
    closed: bool,
}

impl WorkerSession {
    /// Creates the worker pipe, has the supervisor start a registrar for it
    /// and waits for that registrar to connect.
    pub async fn start(
        link: &SupervisorLink,
        host: &dyn HelperHost,
        timeouts: TimeoutSettings,
        cancel: &CancellationToken,
    ) -> Result<Self, CoordinatorError> {
        let pipe = PipeName::new(PipeRole::Registrar);
        let mut listener = PipeListener::bind(&pipe)?;
        let pid = link.start_registrar(&pipe, cancel).await?;
        let mut process = host.attach_worker(pid);

        let accepted = tokio::select! {
            biased;
            stream = listener.accept() => stream.map_err(CoordinatorError::from),
            code = exited(&mut process) => Err(CoordinatorError::WorkerExited(code)),
            _ = tokio::time::sleep(timeouts.connect()) => {
                Err(CoordinatorError::ConnectTimeout("registrar", timeouts.connect()))
            }
            _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
        };
        match accepted {
            Ok(stream) => {
                info!(pipe = %pipe, pid, "registrar connected");
                Ok(Self {
                    pipe,
                    pid,
                    channel: MessageChannel::new(stream),
                    process,
                    timeouts,
                    closed: false,
                })
            }
            Err(e) => {
                if let Some(process) = process.as_mut() {
                    reap(process.as_mut(), &timeouts).await;
                }
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends one file and waits for its result. Cancellation abandons the
    /// exchange and leaves the channel unusable.
    pub async fn register(
        &mut self,
        file: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<RegistrationResult, CoordinatorError> {
        let channel = &mut self.channel;
        let reply = tokio::select! {
            reply = async {
                channel.write(&Message::registration_request(file)).await?;
                channel.read().await
            } => reply?,
            _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
        };
        match reply {
            Message::RegistrationResult(result) => Ok(result),
            other => Err(CoordinatorError::UnexpectedMessage(other.kind())),
        }
    }

    /// Sends `Terminate` if the channel is still in sync, then reaps the
    /// process. Later calls do nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.channel.is_usable() {
            if let Err(e) = self.channel.write(&Message::Terminate).await {
                debug!(pipe = %self.pipe, error = %e, "registrar already gone");
            }
        }
        if let Some(process) = self.process.as_mut() {
            reap(process.as_mut(), &self.timeouts).await;
        }
        debug!(pipe = %self.pipe, pid = self.pid, "registrar session closed");
    }
}

/// Resolves with the exit code once the registrar dies. Never resolves for a
/// process that cannot be watched.
async fn exited(process: &mut Option<Box<dyn HelperProcess>>) -> Option<i32> {
    if let Some(process) = process.as_mut() {
        match process.wait().await {
            Ok(code) => return code,
            Err(e) => debug!(error = %e, "cannot watch registrar process"),
        }
    }
    std::future::pending().await
}
