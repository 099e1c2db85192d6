//! testvm Runtime - ephemeral QEMU test VM lifecycle.
//!
//! This crate builds a NixOS VM image, boots it under QEMU, proxies the QEMU
//! monitor through a local Unix socket, bridges SSH into the guest (with a
//! reverse tunnel back to the monitor proxy) and logs the desktop user in.

pub mod builder;
pub mod console;
pub mod host_check;
pub mod keypair;
pub mod login;
pub mod session;
pub mod ssh;
pub mod vmm;

// Re-export common types
pub use builder::{BuildRequest, ImageBuilder, NixBuilder};
pub use console::{MonitorChannel, MonitorClient, MonitorEndpoint, MonitorProxy, MonitorProxyHandle, PromptFramer, MONITOR_PROMPT};
pub use host_check::{check_virtualization_support, VirtualizationSupport};
pub use keypair::KeyPair;
pub use login::LoginSynchronizer;
pub use session::{SessionOrchestrator, StartOptions, VmSession};
pub use ssh::{Identity, RunError, RunOptions, RunScript, SshBridge};
pub use vmm::{HypervisorProvider, LaunchRequest, LaunchedVm, QemuHandler, QemuLauncher, VmHandler};

/// testvm Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
