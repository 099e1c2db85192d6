//! CLI definition and dispatch.

mod startvm;

use clap::Parser;
use testvm_core::error::Result;

pub use startvm::StartVmArgs;

/// testvm - start a NixOS test VM and open a shell in it.
///
/// The VM is built from a nix expression, booted under QEMU, logged in on
/// its graphical console, and the test code directory is mounted at
/// /mnt/code. Leaving the shell shuts the VM down.
#[derive(Parser)]
#[command(name = "testvm", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub start: StartVmArgs,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        self.start.verbose
    }
}

/// Dispatch a parsed CLI to the command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    startvm::execute(cli.start).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["testvm", "tests/gnome.nix"]).unwrap();
        assert_eq!(cli.start.nixfile, PathBuf::from("tests/gnome.nix"));
        assert!(!cli.verbose());
        assert!(cli.start.vm_dir.is_none());
        assert_eq!(cli.start.code_dir, PathBuf::from("capability-tests"));
        assert!(cli.start.config.is_none());
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::try_parse_from([
            "testvm",
            "tests/kde.nix",
            "--verbose",
            "--vm-dir",
            "/tmp/vm",
            "--code-dir",
            "/src/tests",
            "--config",
            "testvm.yaml",
        ])
        .unwrap();
        assert!(cli.verbose());
        assert_eq!(cli.start.vm_dir, Some(PathBuf::from("/tmp/vm")));
        assert_eq!(cli.start.code_dir, PathBuf::from("/src/tests"));
        assert_eq!(cli.start.config, Some(PathBuf::from("testvm.yaml")));
    }

    #[test]
    fn test_nixfile_required() {
        assert!(Cli::try_parse_from(["testvm"]).is_err());
    }
}
