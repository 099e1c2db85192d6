//! Session working directory ownership.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use testvm_core::error::{Result, VmError};

/// Working directory for one CLI run.
///
/// A directory given by the user is kept so a later run can resume from it;
/// a temporary one is removed when this value is dropped.
#[derive(Debug)]
pub enum WorkDir {
    Kept(PathBuf),
    Temporary(TempDir),
}

impl WorkDir {
    pub fn new(vm_dir: Option<PathBuf>) -> Result<Self> {
        match vm_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    VmError::Config(format!("cannot create VM dir {}: {}", dir.display(), e))
                })?;
                Ok(Self::Kept(dir))
            }
            None => {
                let dir = tempfile::Builder::new().prefix("testvm-").tempdir()?;
                Ok(Self::Temporary(dir))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Kept(dir) => dir,
            Self::Temporary(dir) => dir.path(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}
