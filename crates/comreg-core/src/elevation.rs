//! Two-phase startup of the elevated supervisor.
//!
//! An unelevated start relaunches the same executable with the same
//! arguments under an elevation request and exits; only the elevated copy
//! goes on to serve. Off Windows there is no prompt, so every process
//! counts as elevated.

use std::io;
use tracing::{info, warn};

/// Exit code when the user declines the elevation prompt (`ERROR_CANCELLED`).
pub const EXIT_ELEVATION_CANCELLED: i32 = 1223;
/// Exit code when the relaunch failed for any other reason.
pub const EXIT_RELAUNCH_FAILED: i32 = 1;

#[derive(Debug)]
pub enum RelaunchOutcome {
    /// The elevated copy is running and will take over.
    Launched,
    Cancelled,
    Failed(io::Error),
}

impl RelaunchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RelaunchOutcome::Launched => 0,
            RelaunchOutcome::Cancelled => EXIT_ELEVATION_CANCELLED,
            RelaunchOutcome::Failed(_) => EXIT_RELAUNCH_FAILED,
        }
    }
}

#[derive(Debug)]
pub enum StartupPhase {
    NeedsElevation,
    Relaunching(RelaunchOutcome),
    Elevated,
}

impl StartupPhase {
    pub fn detect() -> Self {
        if is_elevated() {
            StartupPhase::Elevated
        } else {
            StartupPhase::NeedsElevation
        }
    }

    /// Moves `NeedsElevation` to `Relaunching` by calling `relaunch`; other
    /// phases are terminal and returned as is.
    pub fn advance<F>(self, relaunch: F) -> Self
    where
        F: FnOnce() -> RelaunchOutcome,
    {
        match self {
            StartupPhase::NeedsElevation => {
                let outcome = relaunch();
                match &outcome {
                    RelaunchOutcome::Launched => info!("relaunched with elevation"),
                    RelaunchOutcome::Cancelled => warn!("elevation declined"),
                    RelaunchOutcome::Failed(e) => warn!(error = %e, "elevated relaunch failed"),
                }
                StartupPhase::Relaunching(outcome)
            }
            other => other,
        }
    }

    /// `Some(code)` when this process must exit now instead of serving.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StartupPhase::Relaunching(outcome) => Some(outcome.exit_code()),
            StartupPhase::NeedsElevation => Some(EXIT_RELAUNCH_FAILED),
            StartupPhase::Elevated => None,
        }
    }
}

#[cfg(windows)]
pub fn is_elevated() -> bool {
    use crate::process::OwnedHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    let mut raw: HANDLE = 0;
    // SAFETY: pseudo process handle, valid out pointer.
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut raw) } == 0 {
        return false;
    }
    let token = OwnedHandle::new(raw);
    let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
    let mut len = 0u32;
    // SAFETY: the buffer is a TOKEN_ELEVATION of the declared size.
    let ok = unsafe {
        GetTokenInformation(
            token.raw(),
            TokenElevation,
            (&mut elevation as *mut TOKEN_ELEVATION).cast(),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut len,
        )
    };
    ok != 0 && elevation.TokenIsElevated != 0
}

#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    true
}

/// Starts the current executable again with `args` under the `runas` verb.
#[cfg(windows)]
pub fn relaunch_elevated(args: &[String]) -> RelaunchOutcome {
    use crate::registry::windows::wide;
    use windows_sys::Win32::Foundation::{GetLastError, ERROR_CANCELLED};
    use windows_sys::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOASYNC, SHELLEXECUTEINFOW};
    use windows_sys::Win32::UI::WindowsAndMessaging::SW_HIDE;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return RelaunchOutcome::Failed(e),
    };
    let cwd = std::env::current_dir().ok();
    let verb = wide("runas");
    let file = wide(exe.as_os_str());
    let params = wide(
        args.iter()
            .map(|a| quote_arg(a))
            .collect::<Vec<_>>()
            .join(" "),
    );
    let dir = cwd.as_ref().map(|d| wide(d.as_os_str()));

    // SAFETY: SHELLEXECUTEINFOW is plain data; zero is a valid initial state.
    let mut info: SHELLEXECUTEINFOW = unsafe { std::mem::zeroed() };
    info.cbSize = std::mem::size_of::<SHELLEXECUTEINFOW>() as u32;
    info.fMask = SEE_MASK_NOASYNC;
    info.lpVerb = verb.as_ptr();
    info.lpFile = file.as_ptr();
    info.lpParameters = params.as_ptr();
    info.lpDirectory = dir.as_ref().map_or(std::ptr::null(), |d| d.as_ptr());
    info.nShow = SW_HIDE as i32;

    // SAFETY: every string pointer above outlives the call.
    if unsafe { ShellExecuteExW(&mut info) } != 0 {
        return RelaunchOutcome::Launched;
    }
    let code = unsafe { GetLastError() };
    if code == ERROR_CANCELLED {
        RelaunchOutcome::Cancelled
    } else {
        RelaunchOutcome::Failed(io::Error::from_raw_os_error(code as i32))
    }
}

#[cfg(not(windows))]
pub fn relaunch_elevated(_args: &[String]) -> RelaunchOutcome {
    RelaunchOutcome::Failed(io::Error::new(
        io::ErrorKind::Unsupported,
        "elevated relaunch is only available on Windows",
    ))
}

/// Hides the console window so the elevated helper is not closed by hand.
#[cfg(windows)]
pub fn hide_console() {
    use windows_sys::Win32::System::Console::GetConsoleWindow;
    use windows_sys::Win32::UI::WindowsAndMessaging::{ShowWindow, SW_HIDE};
    // SAFETY: plain FFI calls on the process's own console window.
    unsafe {
        let window = GetConsoleWindow();
        if window != 0 {
            ShowWindow(window, SW_HIDE);
        }
    }
}

#[cfg(not(windows))]
pub fn hide_console() {}

/// Quotes one argument for the Windows command line parser.
#[cfg_attr(not(windows), allow(dead_code))]
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevated_start_serves_without_relaunching() {
        let phase = StartupPhase::Elevated.advance(|| panic!("must not relaunch"));
        assert!(matches!(phase, StartupPhase::Elevated));
        assert_eq!(phase.exit_code(), None);
    }

    #[test]
    fn unelevated_start_relaunches_then_exits() {
        let launched = StartupPhase::NeedsElevation.advance(|| RelaunchOutcome::Launched);
        assert_eq!(launched.exit_code(), Some(0));

        let cancelled = StartupPhase::NeedsElevation.advance(|| RelaunchOutcome::Cancelled);
        assert_eq!(cancelled.exit_code(), Some(EXIT_ELEVATION_CANCELLED));

        let failed = StartupPhase::NeedsElevation
            .advance(|| RelaunchOutcome::Failed(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert_eq!(failed.exit_code(), Some(EXIT_RELAUNCH_FAILED));
    }

    #[cfg(not(windows))]
    #[test]
    fn always_elevated_off_windows() {
        assert!(is_elevated());
        assert!(matches!(StartupPhase::detect(), StartupPhase::Elevated));
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(quote_arg("--pipe"), "--pipe");
        assert_eq!(quote_arg("a b"), "\"a b\"");
        assert_eq!(quote_arg(r"C:\dir with space\"), r#""C:\dir with space\\""#);
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg(""), "\"\"");
    }
}
