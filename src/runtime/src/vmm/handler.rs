//! VmHandler - Runtime operations on a running VM.

use std::process::{Child, ExitStatus};

use testvm_core::error::Result;

/// Trait for runtime operations on a running VM.
///
/// Separates runtime operations (stop, status) from launching, so the
/// session can tear down whatever provider started the VM.
pub trait VmHandler: Send + Sync {
    /// Stop the VM. Must be safe to call more than once.
    fn stop(&mut self) -> Result<()>;

    /// Check if the VM is still running.
    fn is_running(&self) -> bool;

    /// Get the process ID of the running VM.
    fn pid(&self) -> u32;
}

/// Handler for the hypervisor process started from the launch script.
pub struct QemuHandler {
    pid: u32,
    /// Child process handle, taken on stop so the process is reaped once.
    process: Option<Child>,
}

impl QemuHandler {
    /// Create a handler that owns the spawned process.
    pub fn from_child(process: Child) -> Self {
        Self {
            pid: process.id(),
            process: Some(process),
        }
    }

    /// Exit status, if the process has already exited.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.process
            .as_mut()
            .and_then(|process| process.try_wait().ok().flatten())
    }
}

impl VmHandler for QemuHandler {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };

        match process.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, ?status, "VM process already exited");
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Error checking process status, forcing kill");
            }
        }

        tracing::debug!(pid = self.pid, "Killing VM process");
        if let Err(e) = process.kill() {
            // InvalidInput means the process exited in the meantime
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!(pid = self.pid, error = %e, "Failed to kill VM process");
            }
        }
        let status = process.wait()?;
        tracing::debug!(pid = self.pid, ?status, "VM process reaped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        if self.process.is_none() {
            return false;
        }
        // Signal 0 checks existence without delivering anything
        unsafe { libc::kill(self.pid as i32, 0) == 0 }
    }
}

impl Drop for QemuHandler {
    fn drop(&mut self) {
        if self.process.is_some() {
            let _ = self.stop();
        }
    }
}
