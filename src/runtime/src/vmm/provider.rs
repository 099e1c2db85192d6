//! HypervisorProvider - Trait for hypervisor backends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use testvm_core::error::Result;
use testvm_core::{SessionConfig, SessionLayout};
use tokio::net::UnixStream;

use super::handler::VmHandler;
use crate::console::MonitorChannel;

/// Everything needed to boot the VM.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Launch script produced by the image build (`bin/run-nixos-vm`)
    pub launch_script: PathBuf,
    /// Persistent guest disk image
    pub disk_image: PathBuf,
    /// Unix socket the hypervisor connects its monitor to
    pub monitor_socket: PathBuf,
    /// Host directory shared into the guest
    pub code_dir: PathBuf,
    /// 9p mount tag for the shared directory
    pub mount_tag: String,
    /// Guest port SSH listens on
    pub guest_ssh_port: u16,
    /// First candidate VNC port
    pub vnc_base_port: u16,
    /// Number of VNC ports probed
    pub vnc_port_candidates: u16,
    /// How long the hypervisor gets to connect its monitor
    pub monitor_connect_timeout: Duration,
    /// Pass hypervisor output through to the terminal
    pub verbose: bool,
}

impl LaunchRequest {
    pub fn new(layout: &SessionLayout, config: &SessionConfig, code_dir: &Path, verbose: bool) -> Self {
        Self {
            launch_script: layout.launch_script(),
            disk_image: layout.disk_image(),
            monitor_socket: layout.monitor_socket(),
            code_dir: code_dir.to_path_buf(),
            mount_tag: config.mount_tag.clone(),
            guest_ssh_port: config.guest_ssh_port,
            vnc_base_port: config.vnc_base_port,
            vnc_port_candidates: config.vnc_port_candidates,
            monitor_connect_timeout: config.monitor_connect_timeout(),
            verbose,
        }
    }
}

/// A booted VM.
pub struct LaunchedVm {
    /// Process control
    pub handler: Box<dyn VmHandler>,
    /// Accepted monitor connection; the greeting has not been read yet
    pub monitor: MonitorChannel<UnixStream>,
    /// Host port forwarded to the guest's SSH port
    pub ssh_port: u16,
    /// Host VNC port
    pub vnc_port: u16,
}

/// Trait for hypervisor backends.
#[async_trait]
pub trait HypervisorProvider: Send + Sync {
    /// Boot a VM and return once its monitor has connected.
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedVm>;
}
