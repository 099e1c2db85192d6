//! Remote-shell bridge.
//!
//! One generated `run-ssh-<user>` wrapper per guest account. Every wrapper
//! carries the forwarded SSH port, the session key, and a reverse tunnel that
//! exposes the monitor proxy socket inside the guest on a fixed port, so guest
//! tooling can inject keys and take screenshots.
//!
//! Host key checking is disabled: the guest is rebuilt at will and its key
//! changes with it.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};

use testvm_core::error::{Result, VmError};
use testvm_core::{ReadinessPolicy, SessionConfig, SessionLayout};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status ssh uses for its own failures (connection refused or reset,
/// authentication not yet possible while the guest boots).
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Guest account a command runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Ordinary desktop user
    User,
    /// Administrator
    Admin,
}

/// Options for a captured run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Kill the command if it runs longer than this
    pub timeout: Option<Duration>,
    /// Bytes written to the command's stdin
    pub input: Option<Vec<u8>>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            input: None,
        }
    }

    pub fn with_input(input: Vec<u8>) -> Self {
        Self {
            timeout: None,
            input: Some(input),
        }
    }
}

/// Why a captured run did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to start {}: {source}", script.display())]
    Spawn {
        script: PathBuf,
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("exited with {status}: {stderr}")]
    Exited { status: ExitStatus, stderr: String },
}

impl RunError {
    /// Timeouts and ssh connection failures are worth retrying while the
    /// guest boots; anything else is not.
    pub fn is_retriable(&self) -> bool {
        match self {
            RunError::TimedOut(_) => true,
            RunError::Exited { status, .. } => status.code() == Some(SSH_CONNECTION_FAILURE),
            RunError::Spawn { .. } => false,
        }
    }

    fn into_vm_error(self, command: &str) -> VmError {
        match self {
            RunError::Exited { status, stderr } => VmError::GuestCommand {
                command: command.to_string(),
                status: status.code(),
                stderr: stderr.trim().to_string(),
            },
            RunError::Spawn { script, source } => VmError::Other(format!(
                "Failed to start {}: {}",
                script.display(),
                source
            )),
            RunError::TimedOut(timeout) => VmError::GuestCommand {
                command: command.to_string(),
                status: None,
                stderr: format!("timed out after {:?}", timeout),
            },
        }
    }
}

/// Parameters baked into a wrapper script.
#[derive(Debug, Clone)]
struct ScriptParams<'a> {
    ssh: &'a str,
    ssh_port: u16,
    private_key: &'a Path,
    tunnel_port: u16,
    proxy_socket: &'a Path,
    user: &'a str,
}

/// A generated, executable ssh wrapper for one guest account.
#[derive(Debug, Clone)]
pub struct RunScript {
    path: PathBuf,
    user: String,
}

impl RunScript {
    fn write(path: PathBuf, params: &ScriptParams<'_>) -> Result<Self> {
        let body = format!(
            "#!/bin/sh\n{} -F /dev/null -p {} -oStrictHostKeyChecking=no -oUserKnownHostsFile=/dev/null -i {} -R {}:{} {}@localhost \"$@\"\n",
            shell_quote(params.ssh),
            params.ssh_port,
            shell_quote(&params.private_key.display().to_string()),
            params.tunnel_port,
            shell_quote(&params.proxy_socket.display().to_string()),
            params.user,
        );
        std::fs::write(&path, body)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(Self {
            path,
            user: params.user.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Guest account name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Run a command in the guest with output captured.
    pub async fn run(&self, args: &[&str], options: RunOptions) -> std::result::Result<Output, RunError> {
        let mut command = Command::new(&self.path);
        command
            .args(args)
            .stdin(if options.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            script: self.path.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let input = options.input.unwrap_or_default();
        let exchange = async move {
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    // The remote side may stop reading early
                    let _ = stdin.write_all(&input).await;
                }
            };
            let (_, output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| RunError::TimedOut(timeout))?,
            None => exchange.await,
        }
        .map_err(|source| RunError::Spawn {
            script: self.path.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(RunError::Exited {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }

    /// Run a command in the guest and fail with `GuestCommand` if it does not
    /// succeed.
    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run(args, RunOptions::default())
            .await
            .map_err(|e| e.into_vm_error(&args.join(" ")))
    }

    /// Run a command attached to the current terminal.
    pub async fn interactive(&self, args: &[&str]) -> Result<ExitStatus> {
        let status = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(status)
    }
}

/// SSH access to the guest as the ordinary user and the administrator.
#[derive(Debug, Clone)]
pub struct SshBridge {
    user: RunScript,
    admin: RunScript,
    readiness: ReadinessPolicy,
    mount_tag: String,
    mount_point: String,
}

impl SshBridge {
    /// Write the wrapper scripts for this session. Scripts from an earlier
    /// session are overwritten since the forwarded port changes every start.
    pub fn create(layout: &SessionLayout, config: &SessionConfig, ssh_port: u16) -> Result<Self> {
        let private_key = layout.private_key();
        let proxy_socket = layout.monitor_proxy_socket();
        let script = |user: &str| {
            RunScript::write(
                layout.run_script(user),
                &ScriptParams {
                    ssh: &config.programs.ssh,
                    ssh_port,
                    private_key: &private_key,
                    tunnel_port: config.monitor_tunnel_port,
                    proxy_socket: &proxy_socket,
                    user,
                },
            )
        };

        let user = script(&config.identities.user)?;
        let admin = script(&config.identities.admin)?;
        tracing::info!(
            user = %user.path().display(),
            admin = %admin.path().display(),
            "SSH run scripts written"
        );

        Ok(Self {
            user,
            admin,
            readiness: config.readiness.clone(),
            mount_tag: config.mount_tag.clone(),
            mount_point: config.guest_mount_point.clone(),
        })
    }

    pub fn user(&self) -> &RunScript {
        &self.user
    }

    pub fn admin(&self) -> &RunScript {
        &self.admin
    }

    pub fn script(&self, identity: Identity) -> &RunScript {
        match identity {
            Identity::User => &self.user,
            Identity::Admin => &self.admin,
        }
    }

    /// Poll the guest with a no-op command until SSH answers.
    ///
    /// Every attempt gets the full per-attempt timeout; a failed attempt
    /// sleeps out the rest of its window, except the last one, so the total
    /// wait never exceeds `attempts * attempt_timeout`. Returns the number of
    /// the attempt that succeeded.
    pub async fn wait_until_ready(&self) -> Result<u32> {
        let attempts = self.readiness.attempts;
        let window = self.readiness.attempt_timeout();

        for attempt in 1..=attempts {
            let started = Instant::now();
            match self.admin.run(&["true"], RunOptions::with_timeout(window)).await {
                Ok(_) => {
                    tracing::info!(attempt, "SSH is ready");
                    return Ok(attempt);
                }
                Err(e) if e.is_retriable() => {
                    tracing::info!(attempt, attempts, error = %e, "SSH connection attempt failed");
                }
                Err(e) => return Err(e.into_vm_error("true")),
            }

            if attempt < attempts {
                let elapsed = started.elapsed();
                if elapsed < window {
                    tokio::time::sleep(window - elapsed).await;
                }
            }
        }

        Err(VmError::ReadinessTimeout {
            target: "remote shell".to_string(),
            waited_secs: window.as_secs() * u64::from(attempts),
        })
    }

    /// Mount the shared directory inside the guest over 9p.
    pub async fn mount_shared_dir(&self) -> Result<()> {
        tracing::info!(mount_point = %self.mount_point, "Mounting shared directory in guest");
        self.admin
            .run_checked(&["mkdir", "-p", &self.mount_point])
            .await?;
        self.admin
            .run_checked(&[
                "mount",
                "-t",
                "9p",
                "-o",
                "trans=virtio",
                &self.mount_tag,
                &self.mount_point,
                "-oversion=9p2000.L",
            ])
            .await?;
        Ok(())
    }

    /// Run a host-side shell script in the guest as the ordinary user, if the
    /// file exists. The script is piped to `sh` on stdin. A failing script is
    /// logged and does not abort the session.
    ///
    /// Returns whether the script ran.
    pub async fn run_guest_script(&self, script: &Path, label: &str) -> Result<bool> {
        if !script.exists() {
            tracing::debug!(script = %script.display(), "No {} found", label);
            return Ok(false);
        }

        tracing::info!(script = %script.display(), "Running {}", label);
        let input = std::fs::read(script)?;
        match self.user.run(&["sh"], RunOptions::with_input(input)).await {
            Ok(_) => {}
            Err(e @ RunError::Spawn { .. }) => return Err(e.into_vm_error("sh")),
            Err(e) => {
                tracing::warn!(script = %script.display(), error = %e, "{} failed", label);
            }
        }
        Ok(true)
    }
}

/// Quote a word for `/bin/sh` if it contains anything beyond a safe set.
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
