//! SSH key pair scoped to a session directory.
//!
//! Generated once with an empty passphrase and reused by every later session
//! against the same directory. Existence of the private key is the only
//! validity check.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use testvm_core::error::{Result, VmError};
use testvm_core::SessionLayout;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: PathBuf,
    public_key: String,
}

impl KeyPair {
    /// Load the session's key pair, generating it with `ssh_keygen` if the
    /// private key does not exist yet.
    pub async fn ensure(layout: &SessionLayout, ssh_keygen: &str) -> Result<Self> {
        let private_key = layout.private_key();

        if private_key.exists() {
            tracing::debug!(path = %private_key.display(), "Reusing SSH key pair");
        } else {
            tracing::info!(path = %private_key.display(), "Generating SSH key pair");
            let output = Command::new(ssh_keygen)
                .arg("-N")
                .arg("")
                .arg("-f")
                .arg(&private_key)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| VmError::KeyPair(format!("Failed to run {}: {}", ssh_keygen, e)))?;

            if !output.status.success() {
                return Err(VmError::KeyPair(format!(
                    "{} exited with {}: {}",
                    ssh_keygen,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        let public_key_path = layout.public_key();
        let public_key = std::fs::read_to_string(&public_key_path).map_err(|e| {
            VmError::KeyPair(format!(
                "Failed to read public key {}: {}",
                public_key_path.display(),
                e
            ))
        })?;

        Ok(Self {
            private_key,
            public_key: public_key.trim_end().to_string(),
        })
    }

    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    /// Public key line, as passed to the image build.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}
