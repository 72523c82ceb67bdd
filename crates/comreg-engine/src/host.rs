//! Where helper processes come from.
//!
//! [`OsHost`] starts the real launcher executable and tracks registrar
//! workers by the ids the supervisor reports. Tests plug in hosts that run
//! the same loops in-process.

use async_trait::async_trait;
use comreg_core::process::{ProcessHandle, ProcessState};
use comreg_core::settings::TimeoutSettings;
use comreg_core::PipeName;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// A running helper the coordinator may have to wait for or kill.
#[async_trait]
pub trait HelperProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves when the process exits, with its exit code if known.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait HelperHost: Send + Sync {
    /// Starts the supervisor, told to connect to `pipe`.
    async fn launch_supervisor(&self, pipe: &PipeName) -> io::Result<Box<dyn HelperProcess>>;

    /// Tracks a registrar the supervisor started. `None` if the process
    /// cannot be opened, in which case only the channel controls it.
    fn attach_worker(&self, pid: u32) -> Option<Box<dyn HelperProcess>>;
}

/// Gives `process` the grace period to exit after `Terminate`, then kills it.
pub async fn reap(process: &mut dyn HelperProcess, timeouts: &TimeoutSettings) {
    let pid = process.id();
    match tokio::time::timeout(timeouts.terminate_grace(), process.wait()).await {
        Ok(Ok(code)) => {
            debug!(?pid, ?code, "helper exited");
            return;
        }
        Ok(Err(e)) => debug!(?pid, error = %e, "cannot wait for helper"),
        Err(_) => debug!(?pid, "helper still running after grace period"),
    }
    if let Err(e) = process.kill().await {
        warn!(?pid, error = %e, "failed to kill helper");
    }
    if tokio::time::timeout(timeouts.kill_wait(), process.wait())
        .await
        .is_err()
    {
        warn!(?pid, "helper did not exit after kill");
    }
}

pub struct OsHost {
    launcher: PathBuf,
    envs: Vec<(OsString, OsString)>,
}

impl OsHost {
    pub fn new(launcher: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
            envs: Vec::new(),
        }
    }

    /// Sets an environment variable for the launcher. Registrars inherit
    /// the launcher's environment.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl HelperHost for OsHost {
    async fn launch_supervisor(&self, pipe: &PipeName) -> io::Result<Box<dyn HelperProcess>> {
        let mut command = Command::new(&self.launcher);
        command.arg("--pipe").arg(pipe.as_str());
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        let child = command.spawn()?;
        debug!(pid = ?child.id(), launcher = %self.launcher.display(), "launcher started");
        Ok(Box::new(ChildProcess(child)))
    }

    fn attach_worker(&self, pid: u32) -> Option<Box<dyn HelperProcess>> {
        match ProcessHandle::open(pid) {
            Ok(handle) => Some(Box::new(ForeignProcess(handle))),
            Err(e) => {
                warn!(pid, error = %e, "cannot open registrar process");
                None
            }
        }
    }
}

struct ChildProcess(Child);

#[async_trait]
impl HelperProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }
}

/// Process started by the supervisor, not by us.
struct ForeignProcess(ProcessHandle);

#[async_trait]
impl HelperProcess for ForeignProcess {
    fn id(&self) -> Option<u32> {
        Some(self.0.id())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        match self.0.wait().await? {
            ProcessState::Exited(code) => Ok(code),
            ProcessState::Running => Ok(None),
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.terminate()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use comreg_core::PipeRole;
    use std::time::Duration;

    fn fast_timeouts() -> TimeoutSettings {
        TimeoutSettings {
            connect_secs: 1,
            terminate_grace_ms: 50,
            kill_wait_ms: 1000,
        }
    }

    #[tokio::test]
    async fn launcher_exit_code_is_reported() {
        let host = OsHost::new("false");
        let mut launcher = host
            .launch_supervisor(&PipeName::new(PipeRole::ProcessLauncher))
            .await
            .unwrap();
        assert_eq!(launcher.wait().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn reap_kills_stragglers() {
        let mut child = ChildProcess(Command::new("sleep").arg("30").spawn().unwrap());
        let started = tokio::time::Instant::now();
        reap(&mut child, &fast_timeouts()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.0.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_worker_pid_is_not_attached() {
        let host = OsHost::new("unused");
        assert!(host.attach_worker(2_000_000_000).is_none());
    }
}
