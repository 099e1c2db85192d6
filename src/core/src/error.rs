use thiserror::Error;

/// testvm error types
#[derive(Error, Debug)]
pub enum VmError {
    /// The user ended the session (Ctrl-C during setup)
    #[error("Session interrupted by user")]
    Interrupted,

    /// The image build tool exited unsuccessfully
    #[error("Image build failed ({})", describe_status(*status))]
    BuildFailed {
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// A readiness poll ran out of attempts
    #[error("Timed out waiting for {target} after {waited_secs} seconds")]
    ReadinessTimeout { target: String, waited_secs: u64 },

    /// Hypervisor failed to start
    #[error("VM boot failed: {message}")]
    BootError {
        message: String,
        hint: Option<String>,
    },

    /// Unexpected condition on the console or proxy socket
    #[error("Console transport error: {0}")]
    Transport(String),

    /// A command run inside the guest failed
    #[error("Guest command `{command}` failed ({}): {stderr}", describe_status(*status))]
    GuestCommand {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// SSH key provisioning failed
    #[error("Key pair error: {0}")]
    KeyPair(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl VmError {
    /// Whether this error is an expected, user-actionable outcome.
    ///
    /// Expected errors are reported without diagnostic noise: an interrupt is
    /// silent and a build failure only shows the build tool's own output.
    pub fn is_expected(&self) -> bool {
        matches!(self, VmError::Interrupted | VmError::BuildFailed { .. })
    }
}

fn describe_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl From<serde_json::Error> for VmError {
    fn from(err: serde_json::Error) -> Self {
        VmError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for VmError {
    fn from(err: serde_yaml::Error) -> Self {
        VmError::Serialization(err.to_string())
    }
}

/// Result type alias for testvm operations
pub type Result<T> = std::result::Result<T, VmError>;
