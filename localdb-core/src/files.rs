//! On-disk backing files of an ephemeral database

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{LocalDbError, Result};
use crate::naming::Identifier;

/// Data and log file paths for one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingFiles {
    pub data: PathBuf,
    pub log: PathBuf,
}

impl BackingFiles {
    /// `<dir>/<id>.mdf` and `<dir>/<id>_log.ldf`
    pub fn in_dir(dir: impl AsRef<Path>, id: &Identifier) -> Self {
        let dir = dir.as_ref();
        Self {
            data: dir.join(format!("{}.mdf", id)),
            log: dir.join(format!("{}_log.ldf", id)),
        }
    }

    /// Files in the user profile directory, where LocalDB keeps them by default
    pub fn in_profile(id: &Identifier) -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| LocalDbError::config("could not determine user profile directory"))?;
        Ok(Self::in_dir(home, id))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        [self.data.as_path(), self.log.as_path()].into_iter()
    }

    pub fn exists_any(&self) -> bool {
        self.paths().any(Path::exists)
    }

    /// Delete both files, returning how many were actually present.
    ///
    /// A missing file is not an error.
    pub fn remove(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.paths() {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!("Removed backing file {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(LocalDbError::files(path, e)),
            }
        }
        Ok(removed)
    }
}
