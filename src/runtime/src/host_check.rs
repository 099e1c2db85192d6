//! Host virtualization support detection.
//!
//! QEMU falls back to software emulation without KVM, so a failed check is
//! reported as a warning by callers rather than aborting the session.

use std::path::Path;

use testvm_core::error::{Result, VmError};

const KVM_DEVICE: &str = "/dev/kvm";

/// Information about virtualization support.
#[derive(Debug, Clone)]
pub struct VirtualizationSupport {
    /// Human-readable description of the virtualization backend.
    pub backend: String,
    /// Additional details about the support.
    pub details: String,
}

/// Check if the current host supports hardware-accelerated QEMU.
///
/// Returns `Ok(VirtualizationSupport)` if supported, or an error explaining why not.
pub fn check_virtualization_support() -> Result<VirtualizationSupport> {
    #[cfg(target_os = "linux")]
    {
        check_kvm(Path::new(KVM_DEVICE))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = Path::new(KVM_DEVICE);
        Err(VmError::Other(
            "KVM is only available on Linux; the VM will run under emulation".to_string(),
        ))
    }
}

/// Check that the KVM device exists and is read/write accessible.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn check_kvm(device: &Path) -> Result<VirtualizationSupport> {
    if !device.exists() {
        return Err(VmError::Other(format!(
            "KVM is not available: {} not found. \
             Ensure KVM kernel modules are loaded (modprobe kvm kvm_intel or kvm_amd).",
            device.display()
        )));
    }

    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
    {
        Ok(_) => Ok(VirtualizationSupport {
            backend: "KVM".to_string(),
            details: "Linux KVM hardware virtualization is available".to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(VmError::Other(format!(
            "KVM access denied: {}. Add your user to the 'kvm' group: \
             sudo usermod -aG kvm $USER",
            e
        ))),
        Err(e) => Err(VmError::Other(format!(
            "Failed to access {}: {}",
            device.display(),
            e
        ))),
    }
}
