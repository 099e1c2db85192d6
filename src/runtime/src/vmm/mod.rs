//! VMM module - hypervisor lifecycle.
//!
//! - `HypervisorProvider`: launches a VM and hands back its monitor connection
//! - `QemuLauncher`: provider backed by the nix-generated `run-nixos-vm` script
//! - `VmHandler`: runtime operations on a running VM process
//! - `ports`: host port selection for SSH forwarding and VNC

mod handler;
pub mod ports;
mod provider;
mod qemu;

pub use handler::{QemuHandler, VmHandler};
pub use provider::{HypervisorProvider, LaunchRequest, LaunchedVm};
pub use qemu::QemuLauncher;
