//! Image builder - produces the VM launch script from a nix expression.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use testvm_core::error::{Result, VmError};
use tokio::process::Command;

/// Inputs for one image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Nix expression describing the VM (`*.nix`)
    pub nixfile: PathBuf,
    /// Where the build result is linked (`<workdir>/nix-vm-script`)
    pub out_link: PathBuf,
    /// Public key authorized for every guest account
    pub public_key: String,
    /// Password of the ordinary guest user
    pub user_password: String,
    /// If this file exists the build is skipped
    pub marker: Option<PathBuf>,
    /// Stream build output to the terminal instead of capturing it
    pub verbose: bool,
}

/// Trait for image build backends.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image and return the result directory.
    async fn build(&self, request: &BuildRequest) -> Result<PathBuf>;
}

/// Builds the VM with `nix-build -A default.vm`.
#[derive(Debug, Clone)]
pub struct NixBuilder {
    program: String,
    host_user_id: u32,
}

impl NixBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        // SAFETY: getuid has no preconditions and cannot fail
        let host_user_id = unsafe { libc::getuid() };
        Self {
            program: program.into(),
            host_user_id,
        }
    }

    pub fn with_host_user_id(mut self, uid: u32) -> Self {
        self.host_user_id = uid;
        self
    }

    /// Arguments passed to the build tool.
    pub fn args(&self, request: &BuildRequest) -> Vec<String> {
        vec![
            "-A".to_string(),
            "default.vm".to_string(),
            "--argstr".to_string(),
            "user_password".to_string(),
            request.user_password.clone(),
            "--argstr".to_string(),
            "ssh_key".to_string(),
            request.public_key.clone(),
            "--argstr".to_string(),
            "host_user_id".to_string(),
            self.host_user_id.to_string(),
            "--out-link".to_string(),
            request.out_link.display().to_string(),
            request.nixfile.display().to_string(),
        ]
    }
}

impl Default for NixBuilder {
    fn default() -> Self {
        Self::new("nix-build")
    }
}

#[async_trait]
impl ImageBuilder for NixBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<PathBuf> {
        if let Some(marker) = &request.marker {
            if marker.exists() {
                tracing::debug!(marker = %marker.display(), "Image already built, skipping");
                return Ok(request.out_link.clone());
            }
        }

        tracing::info!(nixfile = %request.nixfile.display(), "Running nix-build");

        let mut command = Command::new(&self.program);
        command.args(self.args(request)).stdin(Stdio::null());
        if request.verbose {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let output = command.output().await.map_err(|e| VmError::BootError {
            message: format!("Failed to run {}: {}", self.program, e),
            hint: Some("Install nix or set programs.nix_build in the config".to_string()),
        })?;

        if !output.status.success() {
            return Err(VmError::BuildFailed {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        tracing::info!(result = %request.out_link.display(), "Image built");
        Ok(request.out_link.clone())
    }
}

/// Strip the `.nix` extension, giving the base path the guest scripts are
/// named after (`<base>.sh`, `<base>_post.sh`).
pub fn nixfile_base(nixfile: &Path) -> Result<PathBuf> {
    let raw = nixfile.to_str().ok_or_else(|| {
        VmError::Config(format!("nixfile path is not UTF-8: {}", nixfile.display()))
    })?;
    match raw.strip_suffix(".nix") {
        Some(base) if !base.is_empty() => Ok(PathBuf::from(base)),
        _ => Err(VmError::Config(format!(
            "nixfile must end in .nix: {}",
            nixfile.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn request(dir: &Path) -> BuildRequest {
        BuildRequest {
            nixfile: PathBuf::from("/tests/desktop.nix"),
            out_link: dir.join("nix-vm-script"),
            public_key: "ssh-rsa AAAA key".to_string(),
            user_password: "password".to_string(),
            marker: Some(dir.join("setup-complete")),
            verbose: false,
        }
    }

    fn fake_tool(dir: &Path, body: &str) -> String {
        let script = dir.join("nix-build");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[test]
    fn test_args() {
        let dir = tempfile::tempdir().unwrap();
        let builder = NixBuilder::new("nix-build").with_host_user_id(1000);
        let args = builder.args(&request(dir.path()));
        assert_eq!(
            args[..11],
            [
                "-A",
                "default.vm",
                "--argstr",
                "user_password",
                "password",
                "--argstr",
                "ssh_key",
                "ssh-rsa AAAA key",
                "--argstr",
                "host_user_id",
                "1000"
            ]
        );
        assert_eq!(args[11], "--out-link");
        assert!(args[12].ends_with("nix-vm-script"));
        assert_eq!(args[13], "/tests/desktop.nix");
    }

    #[tokio::test]
    async fn test_build_success() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.log");
        let tool = fake_tool(dir.path(), &format!("echo \"$@\" > {}", log.display()));

        let result = NixBuilder::new(tool).build(&request(dir.path())).await.unwrap();
        assert_eq!(result, dir.path().join("nix-vm-script"));
        let logged = std::fs::read_to_string(log).unwrap();
        assert!(logged.starts_with("-A default.vm --argstr user_password password"));
    }

    #[tokio::test]
    async fn test_build_failure_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo building; echo 'error: attribute missing' >&2; exit 2");

        let err = NixBuilder::new(tool).build(&request(dir.path())).await.unwrap_err();
        match err {
            VmError::BuildFailed {
                status,
                stdout,
                stderr,
            } => {
                assert_eq!(status, Some(2));
                assert_eq!(stdout, "building\n");
                assert!(stderr.contains("attribute missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_marker_skips_build() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        std::fs::write(req.marker.as_ref().unwrap(), "done").unwrap();

        // Would fail if invoked
        let result = NixBuilder::new("false").build(&req).await.unwrap();
        assert_eq!(result, req.out_link);
    }

    #[test]
    fn test_nixfile_base() {
        assert_eq!(
            nixfile_base(Path::new("tests/gnome.nix")).unwrap(),
            PathBuf::from("tests/gnome")
        );
        assert!(matches!(
            nixfile_base(Path::new("tests/gnome.yaml")),
            Err(VmError::Config(_))
        ));
        assert!(nixfile_base(Path::new(".nix")).is_err());
    }
}
