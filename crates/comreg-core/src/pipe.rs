//! Pipe naming and the local duplex transport.
//!
//! Names follow `comreg.<role>-<32 hex digits>`. On Windows they map to a
//! single-instance named pipe `\\.\pipe\<name>`; elsewhere to a Unix domain
//! socket in the temp directory. The coordinator always owns the server end.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

pub const APP_PREFIX: &str = "comreg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    ProcessLauncher,
    Registrar,
}

impl PipeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PipeRole::ProcessLauncher => "processlauncher",
            PipeRole::Registrar => "registrar",
        }
    }

    /// `comreg.<role>-`
    pub fn prefix(self) -> String {
        format!("{APP_PREFIX}.{}-", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeName(String);

impl PipeName {
    pub fn new(role: PipeRole) -> Self {
        Self(format!("{}{}", role.prefix(), uuid::Uuid::new_v4().simple()))
    }

    /// Accepts `raw` only if it carries the expected role prefix and a
    /// non-empty id made of ASCII alphanumerics.
    pub fn parse(role: PipeRole, raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let id = raw.strip_prefix(&role.prefix())?;
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Platform endpoint path for this name.
    pub fn endpoint(&self) -> PathBuf {
        #[cfg(windows)]
        {
            PathBuf::from(format!(r"\\.\pipe\{}", self.0))
        }
        #[cfg(not(windows))]
        {
            std::env::temp_dir().join(&self.0)
        }
    }
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(windows)]
pub type ServerStream = tokio::net::windows::named_pipe::NamedPipeServer;
#[cfg(windows)]
pub type ClientStream = tokio::net::windows::named_pipe::NamedPipeClient;

#[cfg(unix)]
pub type ServerStream = tokio::net::UnixStream;
#[cfg(unix)]
pub type ClientStream = tokio::net::UnixStream;

/// Server end of a pipe, created before the peer process exists.
pub struct PipeListener {
    name: PipeName,
    #[cfg(windows)]
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
}

impl PipeListener {
    #[cfg(windows)]
    pub fn bind(name: &PipeName) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .max_instances(1)
            .create(name.endpoint())?;
        Ok(Self {
            name: name.clone(),
            server: Some(server),
        })
    }

    #[cfg(unix)]
    pub fn bind(name: &PipeName) -> io::Result<Self> {
        let path = name.endpoint();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self {
            name: name.clone(),
            listener,
        })
    }

    pub fn name(&self) -> &PipeName {
        &self.name
    }

    /// Waits for the single peer this pipe exists for.
    #[cfg(windows)]
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        let server = self
            .server
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "pipe already accepted"))?;
        server.connect().await?;
        Ok(server)
    }

    #[cfg(unix)]
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.name.endpoint());
    }
}

const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Connects to the server end, retrying while it is busy or not created yet.
pub async fn connect(name: &PipeName, timeout: Duration) -> io::Result<ClientStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match try_connect(name).await {
            Ok(stream) => return Ok(stream),
            Err(e) if retryable(&e) && Instant::now() < deadline => {
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(windows)]
async fn try_connect(name: &PipeName) -> io::Result<ClientStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(name.endpoint())
}

#[cfg(unix)]
async fn try_connect(name: &PipeName) -> io::Result<ClientStream> {
    tokio::net::UnixStream::connect(name.endpoint()).await
}

fn retryable(err: &io::Error) -> bool {
    #[cfg(windows)]
    {
        const ERROR_PIPE_BUSY: i32 = 231;
        err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(ERROR_PIPE_BUSY)
    }
    #[cfg(not(windows))]
    {
        matches!(
            err.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        )
    }
}
