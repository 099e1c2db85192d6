//! Session working directory layout.
//!
//! Every file a session creates lives under one working directory, and every
//! path is derived from that root. Deleting the directory discards all
//! session state.
//!
//! ```text
//! <workdir>/
//! ├── nix-vm-script            → out-link to the built VM (bin/run-nixos-vm)
//! ├── nixos.qcow2              → guest disk image
//! ├── qemu-monitor.sock        → QEMU monitor (QEMU connects to us)
//! ├── qemu-monitor-proxy.sock  → monitor proxy for short-lived clients
//! ├── id_rsa, id_rsa.pub       → SSH key pair
//! ├── run-ssh-<user>           → generated SSH wrapper per guest account
//! └── setup-complete           → completion marker
//! ```

use std::path::{Path, PathBuf};

use crate::error::Result;

const RESULT_DIR: &str = "nix-vm-script";
const DISK_IMAGE: &str = "nixos.qcow2";
const MONITOR_SOCK: &str = "qemu-monitor.sock";
const MONITOR_PROXY_SOCK: &str = "qemu-monitor-proxy.sock";
const SETUP_COMPLETE_FILE: &str = "setup-complete";
const PRIVATE_KEY: &str = "id_rsa";
const RUN_SSH_PREFIX: &str = "run-ssh-";

/// Paths derived from a session working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the working directory if needed and return its layout.
    ///
    /// A relative root is resolved against the current directory. Generated
    /// scripts embed these paths and must work from anywhere.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Out-link of the image build.
    pub fn result_dir(&self) -> PathBuf {
        self.root.join(RESULT_DIR)
    }

    /// Launch script produced by the image build.
    pub fn launch_script(&self) -> PathBuf {
        self.result_dir().join("bin").join("run-nixos-vm")
    }

    pub fn disk_image(&self) -> PathBuf {
        self.root.join(DISK_IMAGE)
    }

    pub fn monitor_socket(&self) -> PathBuf {
        self.root.join(MONITOR_SOCK)
    }

    pub fn monitor_proxy_socket(&self) -> PathBuf {
        self.root.join(MONITOR_PROXY_SOCK)
    }

    pub fn private_key(&self) -> PathBuf {
        self.root.join(PRIVATE_KEY)
    }

    pub fn public_key(&self) -> PathBuf {
        self.root.join(format!("{PRIVATE_KEY}.pub"))
    }

    /// SSH wrapper script for one guest account.
    pub fn run_script(&self, user: &str) -> PathBuf {
        self.root.join(format!("{RUN_SSH_PREFIX}{user}"))
    }

    pub fn setup_complete_file(&self) -> PathBuf {
        self.root.join(SETUP_COMPLETE_FILE)
    }

    /// Whether one-time setup already ran against this directory.
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete_file().exists()
    }

    /// Persist the completion marker.
    pub fn mark_setup_complete(&self) -> Result<()> {
        std::fs::write(self.setup_complete_file(), "done")?;
        Ok(())
    }
}
