//! MonitorChannel - exclusive request/response access to the QEMU monitor.

use testvm_core::error::{Result, VmError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use super::framer::PromptFramer;
use super::MONITOR_CHUNK_SIZE;

/// The hypervisor's monitor connection.
///
/// Exactly one exchange is in flight at a time: `execute` takes `&mut self`,
/// and the proxy owns the channel by value once it starts serving.
pub struct MonitorChannel<S = UnixStream> {
    stream: S,
    framer: PromptFramer,
}

impl<S> MonitorChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            framer: PromptFramer::new(),
        }
    }

    /// Read until the monitor prints its prompt.
    ///
    /// Returns the bytes received before the prompt. End of stream before the
    /// prompt is a transport fault.
    pub async fn wait_for_prompt(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; MONITOR_CHUNK_SIZE];
        loop {
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| VmError::Transport(format!("Failed to read from monitor: {}", e)))?;
            if n == 0 {
                return Err(VmError::Transport(format!(
                    "Monitor closed the connection before the prompt ({} bytes pending)",
                    self.framer.pending().len()
                )));
            }
            if let Some(response) = self.framer.push(&chunk[..n]) {
                return Ok(response);
            }
        }
    }

    /// Forward raw request bytes and return the framed response.
    pub async fn execute(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.stream
            .write_all(request)
            .await
            .map_err(|e| VmError::Transport(format!("Failed to write to monitor: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| VmError::Transport(format!("Failed to flush monitor: {}", e)))?;
        self.wait_for_prompt().await
    }

    /// Run a single monitor command line.
    pub async fn command(&mut self, command: &str) -> Result<String> {
        let mut request = command.trim_end().as_bytes().to_vec();
        request.push(b'\n');
        let response = self.execute(&request).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}
