use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, VmError};

/// Session configuration
///
/// Every field has a default, so a YAML file only needs to name the values
/// it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Password of the ordinary guest user, baked into the image
    pub user_password: String,

    /// Guest account names used by the remote-shell bridge
    pub identities: Identities,

    /// Remote-shell readiness polling
    pub readiness: ReadinessPolicy,

    /// Login screen polling and key injection
    pub login: LoginPolicy,

    /// How long the monitor proxy waits in `accept` before re-checking
    /// its cancellation flag (milliseconds)
    pub proxy_accept_timeout_ms: u64,

    /// How long to wait for QEMU to connect to the monitor socket (seconds)
    pub monitor_connect_timeout_secs: u64,

    /// SSH port inside the guest
    pub guest_ssh_port: u16,

    /// Port inside the guest that reverse-tunnels to the monitor proxy
    pub monitor_tunnel_port: u16,

    /// First VNC port to probe (QEMU display offsets are relative to it)
    pub vnc_base_port: u16,

    /// Number of VNC ports to probe
    pub vnc_port_candidates: u16,

    /// 9p mount tag shared between QEMU and the guest
    pub mount_tag: String,

    /// Where the shared directory is mounted inside the guest
    pub guest_mount_point: String,

    /// External programs
    pub programs: ProgramConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_password: "password".to_string(),
            identities: Identities::default(),
            readiness: ReadinessPolicy::default(),
            login: LoginPolicy::default(),
            proxy_accept_timeout_ms: 5000,
            monitor_connect_timeout_secs: 120,
            guest_ssh_port: 22,
            monitor_tunnel_port: 2134,
            vnc_base_port: 5900,
            vnc_port_candidates: 100,
            mount_tag: "code".to_string(),
            guest_mount_point: "/mnt/code".to_string(),
            programs: ProgramConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VmError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: SessionConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values that would make the session unusable.
    pub fn validate(&self) -> Result<()> {
        if self.readiness.attempts == 0 {
            return Err(VmError::Config(
                "readiness.attempts must be at least 1".to_string(),
            ));
        }
        if self.login.attempts == 0 {
            return Err(VmError::Config("login.attempts must be at least 1".to_string()));
        }
        if self.vnc_port_candidates == 0 {
            return Err(VmError::Config(
                "vnc_port_candidates must be at least 1".to_string(),
            ));
        }
        let timeouts = [
            ("proxy_accept_timeout_ms", self.proxy_accept_timeout_ms),
            ("monitor_connect_timeout_secs", self.monitor_connect_timeout_secs),
            ("readiness.attempt_timeout_ms", self.readiness.attempt_timeout_ms),
            ("login.poll_interval_ms", self.login.poll_interval_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(VmError::Config(format!("{} must be greater than 0", name)));
        }
        if self.identities.user.is_empty() || self.identities.admin.is_empty() {
            return Err(VmError::Config("identity names must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn proxy_accept_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_accept_timeout_ms)
    }

    pub fn monitor_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_connect_timeout_secs)
    }
}

/// Guest accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Identities {
    /// Ordinary user that owns the desktop session
    pub user: String,

    /// Administrator used for mounts and readiness checks
    pub admin: String,
}

impl Default for Identities {
    fn default() -> Self {
        Self {
            user: "alice".to_string(),
            admin: "root".to_string(),
        }
    }
}

/// Remote-shell readiness polling.
///
/// Worst case wait is `attempts * attempt_timeout_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Maximum number of connection attempts
    pub attempts: u32,

    /// Timeout of one attempt (milliseconds); a failed attempt sleeps out the
    /// rest of this window before the next one
    pub attempt_timeout_ms: u64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            attempt_timeout_ms: 50_000,
        }
    }
}

impl ReadinessPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Login screen polling and key injection timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginPolicy {
    /// Number of screen checks before giving up
    pub attempts: u32,

    /// Pause between screen checks (milliseconds)
    pub poll_interval_ms: u64,

    /// Pause after the first confirm key (milliseconds)
    pub confirm_delay_ms: u64,

    /// Pause after each password key (milliseconds)
    pub key_delay_ms: u64,
}

impl Default for LoginPolicy {
    fn default() -> Self {
        Self {
            attempts: 25,
            poll_interval_ms: 5000,
            confirm_delay_ms: 500,
            key_delay_ms: 200,
        }
    }
}

impl LoginPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    pub fn key_delay(&self) -> Duration {
        Duration::from_millis(self.key_delay_ms)
    }
}

/// External programs invoked by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub nix_build: String,
    pub ssh: String,
    pub ssh_keygen: String,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            nix_build: "nix-build".to_string(),
            ssh: "ssh".to_string(),
            ssh_keygen: "ssh-keygen".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.user_password, "password");
        assert_eq!(config.identities.user, "alice");
        assert_eq!(config.identities.admin, "root");
        assert_eq!(config.readiness.attempts, 20);
        assert_eq!(config.readiness.attempt_timeout(), Duration::from_secs(50));
        assert_eq!(config.login.attempts, 25);
        assert_eq!(config.login.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.proxy_accept_timeout(), Duration::from_secs(5));
        assert_eq!(config.monitor_tunnel_port, 2134);
        assert_eq!(config.vnc_base_port, 5900);
        assert_eq!(config.mount_tag, "code");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = SessionConfig::default();
        config.proxy_accept_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("proxy_accept_timeout_ms"));

        let mut config = SessionConfig::default();
        config.monitor_connect_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("monitor_connect_timeout_secs"));

        let mut config = SessionConfig::default();
        config.readiness.attempt_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("readiness.attempt_timeout_ms"));

        let mut config = SessionConfig::default();
        config.login.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("login.poll_interval_ms"));
    }

    #[test]
    fn test_load_rejects_zero_accept_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testvm.yaml");
        std::fs::write(&path, "proxy_accept_timeout_ms: 0\n").unwrap();

        let err = SessionConfig::load(&path).unwrap_err();
        assert!(matches!(err, VmError::Config(_)));
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testvm.yaml");
        std::fs::write(
            &path,
            "user_password: hunter2\nreadiness:\n  attempts: 3\nprograms:\n  ssh: /usr/local/bin/ssh\n",
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.user_password, "hunter2");
        assert_eq!(config.readiness.attempts, 3);
        // Unnamed fields keep their defaults
        assert_eq!(config.readiness.attempt_timeout_ms, 50_000);
        assert_eq!(config.programs.ssh, "/usr/local/bin/ssh");
        assert_eq!(config.programs.nix_build, "nix-build");
        assert_eq!(config.identities.user, "alice");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionConfig::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, VmError::Config(_)));
    }

    #[test]
    fn test_load_rejects_zero_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testvm.yaml");
        std::fs::write(&path, "login:\n  attempts: 0\n").unwrap();
        let err = SessionConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("login.attempts"));
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = SessionConfig::load_or_default(None).unwrap();
        assert_eq!(config.guest_ssh_port, 22);
    }
}
