//! MonitorProxy - shares the single monitor connection with short-lived clients.
//!
//! QEMU accepts one monitor connection. The proxy takes ownership of it and
//! serves clients on a Unix socket, one at a time: read one request, forward
//! it, wait for the prompt, write the response back, close.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use testvm_core::error::{Result, VmError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::channel::MonitorChannel;
use super::MONITOR_CHUNK_SIZE;

/// Monitor proxy service.
pub struct MonitorProxy;

impl MonitorProxy {
    /// Bind `socket_path` and start serving in a background task.
    ///
    /// The socket is bound before this returns, so clients may connect as soon
    /// as the handle is available. A stale socket file is removed first.
    pub fn spawn<S>(
        channel: MonitorChannel<S>,
        socket_path: impl Into<PathBuf>,
        accept_timeout: Duration,
    ) -> Result<MonitorProxyHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let socket_path = socket_path.into();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                VmError::Transport(format!(
                    "Failed to remove stale proxy socket {}: {}",
                    socket_path.display(),
                    e
                ))
            })?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            VmError::Transport(format!(
                "Failed to bind monitor proxy at {}: {}",
                socket_path.display(),
                e
            ))
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let path = socket_path.clone();
        let task = tokio::spawn(async move {
            let result = serve(channel, listener, shutdown_rx, accept_timeout).await;
            let _ = std::fs::remove_file(&path);
            match &result {
                Ok(()) => tracing::debug!(socket = %path.display(), "Monitor proxy stopped"),
                Err(e) => tracing::warn!(socket = %path.display(), error = %e, "Monitor proxy failed"),
            }
            result
        });

        tracing::info!(socket = %socket_path.display(), "Monitor proxy listening");

        Ok(MonitorProxyHandle {
            socket_path,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Handle to a running monitor proxy.
pub struct MonitorProxyHandle {
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl MonitorProxyHandle {
    /// Path clients connect to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Signal the service to stop. The accept loop observes the signal within
    /// one accept timeout window.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the background task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the service to end and return its outcome.
    pub async fn join(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| VmError::Other(format!("Monitor proxy task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    /// Like [`join`](Self::join), but give up after `limit`. A task still
    /// stuck in a monitor exchange is aborted and its socket file removed;
    /// returns `None` in that case.
    pub async fn join_within(&mut self, limit: Duration) -> Option<Result<()>> {
        let mut task = self.task.take()?;
        match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => Some(
                joined.map_err(|e| VmError::Other(format!("Monitor proxy task failed: {}", e)))
                    .and_then(|result| result),
            ),
            Err(_) => {
                task.abort();
                let _ = std::fs::remove_file(&self.socket_path);
                None
            }
        }
    }

    /// Cancel and wait.
    pub async fn stop(mut self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

impl Drop for MonitorProxyHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn serve<S>(
    mut channel: MonitorChannel<S>,
    listener: UnixListener,
    mut shutdown_rx: watch::Receiver<bool>,
    accept_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            accepted = tokio::time::timeout(accept_timeout, listener.accept()) => {
                let stream = match accepted {
                    // Re-check the shutdown signal
                    Err(_) => continue,
                    Ok(Ok((stream, _))) => stream,
                    Ok(Err(e)) => {
                        return Err(VmError::Transport(format!(
                            "Monitor proxy accept failed: {}",
                            e
                        )));
                    }
                };
                serve_client(&mut channel, stream, accept_timeout).await?;
            }
        }
    }
}

/// Serve one client. Client-side hangups and timeouts are dropped; any
/// other I/O fault, and any monitor fault, ends the service.
async fn serve_client<S>(
    channel: &mut MonitorChannel<S>,
    mut stream: UnixStream,
    io_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = [0u8; MONITOR_CHUNK_SIZE];
    let n = match tokio::time::timeout(io_timeout, stream.read(&mut request)).await {
        Err(_) => {
            tracing::debug!("Monitor proxy client sent nothing, closing");
            return Ok(());
        }
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return client_error(e),
    };

    tracing::trace!(
        request = %String::from_utf8_lossy(&request[..n]).trim_end(),
        "Forwarding monitor request"
    );
    let response = channel.execute(&request[..n]).await?;

    match tokio::time::timeout(io_timeout, stream.write_all(&response)).await {
        Err(_) => Ok(()),
        Ok(Ok(())) => {
            let _ = stream.shutdown().await;
            Ok(())
        }
        Ok(Err(e)) => client_error(e),
    }
}

fn client_error(e: std::io::Error) -> Result<()> {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::TimedOut => {
            tracing::debug!(error = %e, "Monitor proxy client went away");
            Ok(())
        }
        _ => Err(VmError::Transport(format!(
            "Monitor proxy client I/O failed: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Fake monitor: answers every line with "ok: <line>" and the prompt.
    fn fake_monitor() -> MonitorChannel<tokio::io::DuplexStream> {
        let (client, mut qemu) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let n = match qemu.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let line = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
                let reply = format!("ok: {}\r\n(qemu) ", line);
                if qemu.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        MonitorChannel::new(client)
    }

    async fn roundtrip(path: &Path, request: &[u8]) -> Vec<u8> {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_proxy_serves_clients_in_turn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let handle =
            MonitorProxy::spawn(fake_monitor(), &path, Duration::from_millis(100)).unwrap();

        assert_eq!(roundtrip(&path, b"sendkey ret\n").await, b"ok: sendkey ret\r\n");
        assert_eq!(roundtrip(&path, b"sendkey a\n").await, b"ok: sendkey a\r\n");

        handle.stop().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_proxy_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        std::fs::write(&path, b"stale").unwrap();

        let handle =
            MonitorProxy::spawn(fake_monitor(), &path, Duration::from_millis(100)).unwrap();
        assert_eq!(roundtrip(&path, b"info\n").await, b"ok: info\r\n");
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_idle_stops_within_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let handle =
            MonitorProxy::spawn(fake_monitor(), &path, Duration::from_millis(50)).unwrap();

        let started = std::time::Instant::now();
        handle.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_client_hanging_up_does_not_stop_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let handle =
            MonitorProxy::spawn(fake_monitor(), &path, Duration::from_millis(100)).unwrap();

        // Connect and close without sending anything
        drop(UnixStream::connect(&path).await.unwrap());
        assert_eq!(roundtrip(&path, b"info\n").await, b"ok: info\r\n");
        assert!(!handle.is_finished());
        handle.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_never_interleave() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        // Slow monitor that records any request arriving while the previous
        // one is still unanswered
        let overlaps = Arc::new(AtomicUsize::new(0));
        let (client, mut qemu) = duplex(4096);
        {
            let overlaps = overlaps.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match qemu.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    if request.lines().count() > 1 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }

                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let mut extra = [0u8; 64];
                    if let Ok(Ok(m)) =
                        tokio::time::timeout(Duration::from_millis(1), qemu.read(&mut extra)).await
                    {
                        if m > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                    }

                    let reply = format!("ok: {}\r\n(qemu) ", request.trim_end());
                    if qemu.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let handle = MonitorProxy::spawn(
            MonitorChannel::new(client),
            &path,
            Duration::from_millis(500),
        )
        .unwrap();

        let clients: Vec<_> = (0..10)
            .map(|i| {
                let path = path.clone();
                tokio::spawn(async move {
                    let response = roundtrip(&path, format!("cmd {}\n", i).as_bytes()).await;
                    (i, response)
                })
            })
            .collect();

        for client in clients {
            let (i, response) = client.await.unwrap();
            assert_eq!(response, format!("ok: cmd {}\r\n", i).into_bytes());
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_within_aborts_stuck_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        // The monitor stays open but never answers
        let (client, _qemu) = duplex(4096);
        let mut handle = MonitorProxy::spawn(
            MonitorChannel::new(client),
            &path,
            Duration::from_millis(50),
        )
        .unwrap();

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"info\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.cancel();
        let started = std::time::Instant::now();
        assert!(handle.join_within(Duration::from_millis(200)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!path.exists());
        assert!(handle.join_within(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_join_within_returns_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let mut handle =
            MonitorProxy::spawn(fake_monitor(), &path, Duration::from_millis(50)).unwrap();

        handle.cancel();
        let joined = handle.join_within(Duration::from_secs(5)).await;
        assert!(matches!(joined, Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_monitor_closing_ends_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let (client, qemu) = duplex(64);
        drop(qemu);
        let mut handle = MonitorProxy::spawn(
            MonitorChannel::new(client),
            &path,
            Duration::from_millis(100),
        )
        .unwrap();

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"info\n").await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        assert!(response.is_empty());

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, VmError::Transport(_)));
    }
}
