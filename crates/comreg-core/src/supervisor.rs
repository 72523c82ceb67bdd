//! Elevated supervisor loop.
//!
//! The supervisor exists so one elevation covers every worker: it spawns a
//! registrar per `StartRegistrarRequest` with its own token and answers with
//! the new process id.

use crate::channel::MessageChannel;
use crate::error::ChannelError;
use crate::message::{ExtractorKind, Message};
use crate::pipe::{PipeName, PipeRole};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Starts a registrar bound to `pipe` and returns its process id.
    async fn spawn_registrar(&self, pipe: &PipeName) -> io::Result<u32>;
}

/// Spawns the registrar executable and keeps the children for reaping.
pub struct ProcessSpawner {
    program: PathBuf,
    children: Mutex<Vec<Child>>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn live_children(&self) -> usize {
        self.children
            .lock()
            .iter_mut()
            .map(|c| c.try_wait())
            .filter(|status| matches!(status, Ok(None)))
            .count()
    }

    /// Gives each child `grace` to exit on its own, then kills it.
    pub async fn shutdown(&self, grace: Duration) {
        let children = std::mem::take(&mut *self.children.lock());
        for mut child in children {
            let pid = child.id();
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(?pid, %status, "registrar exited"),
                Ok(Err(e)) => warn!(?pid, error = %e, "cannot wait for registrar"),
                Err(_) => {
                    warn!(?pid, "registrar still running, killing");
                    if let Err(e) = child.kill().await {
                        warn!(?pid, error = %e, "failed to kill registrar");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn_registrar(&self, pipe: &PipeName) -> io::Result<u32> {
        let mut command = Command::new(&self.program);
        command.arg("--pipe").arg(pipe.as_str());
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "registrar exited immediately"))?;
        self.children.lock().push(child);
        Ok(pid)
    }
}

/// Serves worker-creation requests until `Terminate`, peer closure or
/// cancellation.
pub async fn serve<S, W>(
    channel: &mut MessageChannel<S>,
    spawner: &W,
    cancel: CancellationToken,
) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: WorkerSpawner + ?Sized,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = channel.read() => match read {
                Ok(message) => message,
                Err(e) if e.is_closed() => {
                    debug!("coordinator closed the supervisor channel");
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        match message {
            Message::StartRegistrarRequest {
                extractor_kind: ExtractorKind::Library,
                pipe_name,
            } => {
                let reply = start_registrar(spawner, &pipe_name).await;
                channel.write(&reply).await?;
            }
            Message::Terminate => {
                info!("terminate received");
                return Ok(());
            }
            other => warn!(kind = other.kind(), "ignoring unexpected message"),
        }
    }
}

async fn start_registrar<W>(spawner: &W, raw: &str) -> Message
where
    W: WorkerSpawner + ?Sized,
{
    let Some(pipe) = PipeName::parse(PipeRole::Registrar, raw) else {
        warn!(pipe = raw, "rejecting pipe name without the registrar prefix");
        return Message::StartRegistrarResult {
            process_id: None,
            error: Some(format!("invalid registrar pipe name: {raw}")),
        };
    };
    match spawner.spawn_registrar(&pipe).await {
        Ok(pid) => {
            info!(pipe = %pipe, pid, "registrar started");
            Message::StartRegistrarResult {
                process_id: Some(pid),
                error: None,
            }
        }
        Err(e) => {
            warn!(pipe = %pipe, error = %e, "failed to start registrar");
            Message::StartRegistrarResult {
                process_id: None,
                error: Some(e.to_string()),
            }
        }
    }
}
