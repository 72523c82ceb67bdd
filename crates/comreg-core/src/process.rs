//! Handles to processes this process did not spawn itself.
//!
//! The coordinator learns worker ids from the supervisor and uses
//! [`ProcessHandle`] to watch and, if needed, kill them.

use std::io;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code when the platform can report it for a non-child.
    Exited(Option<i32>),
}

/// Kernel handle closed on drop.
#[cfg(windows)]
pub(crate) struct OwnedHandle(windows_sys::Win32::Foundation::HANDLE);

#[cfg(windows)]
impl OwnedHandle {
    pub(crate) fn new(raw: windows_sys::Win32::Foundation::HANDLE) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(&self) -> windows_sys::Win32::Foundation::HANDLE {
        self.0
    }
}

#[cfg(windows)]
impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.0 != 0 {
            // SAFETY: the handle is owned and closed exactly once.
            unsafe {
                windows_sys::Win32::Foundation::CloseHandle(self.0);
            }
        }
    }
}

pub struct ProcessHandle {
    pid: u32,
    #[cfg(windows)]
    handle: OwnedHandle,
}

impl ProcessHandle {
    #[cfg(windows)]
    pub fn open(pid: u32) -> io::Result<Self> {
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE, PROCESS_TERMINATE,
        };
        // SAFETY: plain FFI call; a null result is checked below.
        let raw = unsafe {
            OpenProcess(
                PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_TERMINATE | PROCESS_SYNCHRONIZE,
                0,
                pid,
            )
        };
        if raw == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            pid,
            handle: OwnedHandle::new(raw),
        })
    }

    #[cfg(unix)]
    pub fn open(pid: u32) -> io::Result<Self> {
        let handle = Self { pid };
        match handle.state()? {
            ProcessState::Running => Ok(handle),
            ProcessState::Exited(_) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("process {pid} is not running"),
            )),
        }
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    #[cfg(windows)]
    pub fn state(&self) -> io::Result<ProcessState> {
        use windows_sys::Win32::Foundation::STILL_ACTIVE;
        use windows_sys::Win32::System::Threading::GetExitCodeProcess;
        let mut code = 0u32;
        // SAFETY: the handle is open with query rights.
        if unsafe { GetExitCodeProcess(self.handle.raw(), &mut code) } == 0 {
            return Err(io::Error::last_os_error());
        }
        if code == STILL_ACTIVE as u32 {
            Ok(ProcessState::Running)
        } else {
            Ok(ProcessState::Exited(Some(code as i32)))
        }
    }

    #[cfg(unix)]
    pub fn state(&self) -> io::Result<ProcessState> {
        // SAFETY: signal 0 only checks that the process exists.
        if unsafe { libc::kill(self.pid as libc::pid_t, 0) } == 0 {
            return Ok(ProcessState::Running);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(ProcessState::Exited(None)),
            // Exists but belongs to someone else.
            Some(libc::EPERM) => Ok(ProcessState::Running),
            _ => Err(err),
        }
    }

    #[cfg(windows)]
    pub fn terminate(&self) -> io::Result<()> {
        use windows_sys::Win32::System::Threading::TerminateProcess;
        // SAFETY: the handle is open with terminate rights.
        if unsafe { TerminateProcess(self.handle.raw(), 1) } == 0 {
            if let Ok(ProcessState::Exited(_)) = self.state() {
                return Ok(());
            }
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(unix)]
    pub fn terminate(&self) -> io::Result<()> {
        // SAFETY: plain signal delivery.
        if unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    /// Polls until the process exits.
    pub async fn wait(&self) -> io::Result<ProcessState> {
        loop {
            let state = self.state()?;
            if let ProcessState::Exited(_) = state {
                return Ok(state);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Polls until the process exits or `timeout` elapses.
    pub async fn wait_timeout(&self, timeout: Duration) -> io::Result<Option<ProcessState>> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state()?;
            if let ProcessState::Exited(_) = state {
                return Ok(Some(state));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
