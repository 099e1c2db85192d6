//! testvm CLI - boot a NixOS test VM, log in, and open a shell in it.

pub mod commands;
pub mod workdir;

use testvm_core::VmError;

/// Print an error the way the CLI reports it and return the exit code.
///
/// An interrupt is a normal way to leave and exits quietly with 0. A failed
/// build only shows the build tool's own output.
pub fn report(err: &VmError) -> i32 {
    match err {
        VmError::Interrupted => 0,
        VmError::BuildFailed { stdout, stderr, .. } => {
            print!("{stdout}");
            eprint!("{stderr}");
            1
        }
        VmError::BootError {
            hint: Some(hint), ..
        } => {
            eprintln!("Error: {err}");
            eprintln!("Hint: {hint}");
            1
        }
        _ => {
            eprintln!("Error: {err}");
            1
        }
    }
}
