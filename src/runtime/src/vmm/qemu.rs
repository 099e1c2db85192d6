//! QemuLauncher - boots the VM through the nix-generated launch script.
//!
//! The script reads its networking, disk and extra QEMU options from the
//! environment. QEMU connects its human monitor to a Unix socket we listen
//! on, so the monitor is owned by this process from the first byte.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use testvm_core::error::{Result, VmError};
use tokio::net::{UnixListener, UnixStream};

use super::handler::{QemuHandler, VmHandler};
use super::ports;
use super::provider::{HypervisorProvider, LaunchRequest, LaunchedVm};
use crate::console::MonitorChannel;

/// How often the launcher checks whether QEMU died while waiting for the
/// monitor connection.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hypervisor provider that runs `<result>/bin/run-nixos-vm`.
#[derive(Debug, Clone, Default)]
pub struct QemuLauncher;

impl QemuLauncher {
    pub fn new() -> Self {
        Self
    }

    /// `QEMU_NET_OPTS`: forward a loopback host port to the guest's SSH port.
    pub fn net_opts(ssh_port: u16, guest_ssh_port: u16) -> String {
        format!("hostfwd=tcp:127.0.0.1:{}-:{}", ssh_port, guest_ssh_port)
    }

    /// `QEMU_OPTS`: shared directory, pointer device, monitor and VNC display.
    pub fn qemu_opts(request: &LaunchRequest, vnc_display: u16) -> String {
        [
            format!(
                "-virtfs local,path={},security_model=mapped-xattr,mount_tag={}",
                request.code_dir.display(),
                request.mount_tag
            ),
            "-device usb-mouse".to_string(),
            format!("-monitor unix:{}", request.monitor_socket.display()),
            format!("-display vnc=0.0.0.0:{}", vnc_display),
        ]
        .join(" ")
    }
}

#[async_trait]
impl HypervisorProvider for QemuLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedVm> {
        if !request.launch_script.exists() {
            return Err(VmError::BootError {
                message: format!(
                    "Launch script not found: {}",
                    request.launch_script.display()
                ),
                hint: Some("The image build did not produce a VM; remove the setup marker to rebuild".to_string()),
            });
        }

        let ssh_port = ports::free_local_port()?;
        let (vnc_display, vnc_port) =
            ports::find_vnc_display(request.vnc_base_port, request.vnc_port_candidates)?;

        let listener = bind_monitor_socket(&request.monitor_socket)?;

        let net_opts = Self::net_opts(ssh_port, request.guest_ssh_port);
        let qemu_opts = Self::qemu_opts(request, vnc_display);
        tracing::debug!(net_opts = %net_opts, qemu_opts = %qemu_opts, "QEMU options");

        let (stdout, stderr) = if request.verbose {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        // Piped stdin keeps QEMU off the terminal the SSH session uses later
        let child = Command::new(&request.launch_script)
            .env("QEMU_NET_OPTS", &net_opts)
            .env("NIX_DISK_IMAGE", &request.disk_image)
            .env("QEMU_OPTS", &qemu_opts)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| VmError::BootError {
                message: format!("Failed to spawn hypervisor: {}", e),
                hint: Some(format!("Launch script: {}", request.launch_script.display())),
            })?;

        let mut handler = QemuHandler::from_child(child);
        tracing::info!(pid = handler.pid(), ssh_port, vnc_port, "Hypervisor spawned");

        let stream =
            match wait_for_monitor(&listener, &mut handler, request.monitor_connect_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = handler.stop();
                    return Err(e);
                }
            };

        tracing::info!(vnc_port, "VNC display available");

        Ok(LaunchedVm {
            handler: Box::new(handler),
            monitor: MonitorChannel::new(stream),
            ssh_port,
            vnc_port,
        })
    }
}

fn bind_monitor_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "Removing stale monitor socket");
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path).map_err(|e| VmError::BootError {
        message: format!("Failed to bind monitor socket {}: {}", path.display(), e),
        hint: None,
    })
}

/// Accept the hypervisor's single monitor connection.
async fn wait_for_monitor(
    listener: &UnixListener,
    handler: &mut QemuHandler,
    timeout: Duration,
) -> Result<UnixStream> {
    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(VmError::ReadinessTimeout {
                target: "hypervisor monitor".to_string(),
                waited_secs: timeout.as_secs(),
            });
        }

        match tokio::time::timeout(remaining.min(EXIT_POLL_INTERVAL), listener.accept()).await {
            Ok(Ok((stream, _))) => return Ok(stream),
            Ok(Err(e)) => {
                return Err(VmError::BootError {
                    message: format!("Failed to accept monitor connection: {}", e),
                    hint: None,
                });
            }
            Err(_) => {
                if let Some(status) = handler.try_exit_status() {
                    return Err(VmError::BootError {
                        message: format!("Hypervisor exited before connecting its monitor ({})", status),
                        hint: Some("Re-run with --verbose to see the hypervisor output".to_string()),
                    });
                }
            }
        }
    }
}
