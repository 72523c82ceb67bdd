use comreg_core::ChannelError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("elevation was cancelled by the user")]
    ElevationCancelled,

    #[error("failed to start the process launcher: {0}")]
    LauncherFailed(#[source] std::io::Error),

    #[error("process launcher exited with code {0:?} before connecting")]
    LauncherExited(Option<i32>),

    #[error("{0} did not connect within {1:?}")]
    ConnectTimeout(&'static str, Duration),

    #[error("failed to start a registrar worker: {0}")]
    WorkerSpawn(String),

    #[error("registrar worker exited with code {0:?} before connecting")]
    WorkerExited(Option<i32>),

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registration was cancelled")]
    Cancelled,
}

impl CoordinatorError {
    /// True only when the user declined the elevation prompt.
    pub fn is_elevation_cancelled(&self) -> bool {
        matches!(self, CoordinatorError::ElevationCancelled)
    }
}
