//! Start a VM, open a shell in it, shut it down when the shell exits.

use std::path::PathBuf;

use clap::Args;
use testvm_core::error::Result;
use testvm_core::{EventEmitter, SessionConfig, SessionLayout};
use testvm_runtime::{SessionOrchestrator, StartOptions};

use crate::workdir::WorkDir;

#[derive(Args)]
pub struct StartVmArgs {
    /// Path to the .nix file that describes the VM
    pub nixfile: PathBuf,

    /// Print more log messages and show build and QEMU output
    #[arg(long)]
    pub verbose: bool,

    /// Where to keep VM state (default: a temporary directory removed on exit)
    #[arg(long)]
    pub vm_dir: Option<PathBuf>,

    /// Directory shared into the guest at /mnt/code
    #[arg(long, default_value = "capability-tests")]
    pub code_dir: PathBuf,

    /// YAML file overriding session settings
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: StartVmArgs) -> Result<()> {
    let config = SessionConfig::load_or_default(args.config.as_deref())?;
    let workdir = WorkDir::new(args.vm_dir)?;
    tracing::info!(vm_dir = %workdir.path().display(), temporary = workdir.is_temporary(), "Using VM dir");

    let layout = SessionLayout::create(workdir.path())?;
    let user = config.identities.user.clone();
    let orchestrator = SessionOrchestrator::new(config, EventEmitter::default());

    let options = StartOptions {
        nixfile: args.nixfile,
        code_dir: args.code_dir,
        verbose: args.verbose,
    };
    let session = orchestrator.start(layout, options).await?;

    tracing::info!(
        vnc_port = session.vnc_port(),
        run_script = %session.layout().run_script(&user).display(),
        "SSH-ing in to VM. Exit SSH session to shut down VM."
    );
    let shell = session.interactive_shell().await;
    session.shutdown().await?;

    let status = shell?;
    if !status.success() {
        tracing::debug!(%status, "Shell exited with failure");
    }

    drop(workdir);
    Ok(())
}
