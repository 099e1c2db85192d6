//! MonitorClient - one-shot monitor commands through the proxy.
//!
//! Each command opens a fresh connection, sends one line, reads the response
//! until the proxy closes the connection, and disconnects. Host-side code
//! uses the proxy's Unix socket; guest-side tooling reaches the same proxy
//! over TCP through the SSH reverse tunnel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use testvm_core::error::{Result, VmError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// Where the monitor proxy can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEndpoint {
    /// Proxy Unix socket on the host.
    Unix(PathBuf),
    /// TCP endpoint, e.g. the reverse tunnel inside the guest.
    Tcp { host: String, port: u16 },
}

impl std::fmt::Display for MonitorEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorClient {
    endpoint: MonitorEndpoint,
    timeout: Duration,
}

impl MonitorClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(endpoint: MonitorEndpoint) -> Self {
        Self {
            endpoint,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(MonitorEndpoint::Unix(path.into()))
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(MonitorEndpoint::Tcp {
            host: host.into(),
            port,
        })
    }

    /// Bound on a whole command, connect to close.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one monitor command and return its output.
    pub async fn execute(&self, command: &str) -> Result<String> {
        let response = tokio::time::timeout(self.timeout, request(&self.endpoint, command))
            .await
            .map_err(|_| {
                VmError::Transport(format!(
                    "Monitor command '{}' via {} timed out after {:?}",
                    command, self.endpoint, self.timeout
                ))
            })?
            .map_err(|e| {
                VmError::Transport(format!(
                    "Monitor command '{}' via {} failed: {}",
                    command, self.endpoint, e
                ))
            })?;

        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    /// Press a key, e.g. `ret`, `a` or `shift-a`.
    pub async fn send_key(&self, key: &str) -> Result<()> {
        self.execute(&format!("sendkey {}", key)).await?;
        Ok(())
    }

    /// Capture the display into `path` (PPM).
    ///
    /// The proxy only answers once the monitor prompt returns, so the file is
    /// complete when this resolves.
    pub async fn screendump(&self, path: &Path) -> Result<()> {
        self.execute(&format!("screendump {}", path.display())).await?;
        Ok(())
    }
}

async fn request(endpoint: &MonitorEndpoint, command: &str) -> std::io::Result<Vec<u8>> {
    match endpoint {
        MonitorEndpoint::Unix(path) => exchange(UnixStream::connect(path).await?, command).await,
        MonitorEndpoint::Tcp { host, port } => {
            exchange(TcpStream::connect((host.as_str(), *port)).await?, command).await
        }
    }
}

async fn exchange<S>(mut stream: S, command: &str) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("{}\n", command.trim_end()).as_bytes())
        .await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}
