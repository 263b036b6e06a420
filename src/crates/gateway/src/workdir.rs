use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::info;

use crate::error::GatewayResult;

const WORK_ROOT: &str = "work_root";
const LOG_DIR: &str = "logs";

/// Scratch root of one gateway, holding the engine's working root and logs.
///
/// With auto-cleanup the directory is removed when this value is dropped;
/// otherwise it stays on disk for inspection.
#[derive(Debug)]
pub struct WorkingDirectory {
    path: PathBuf,
    guard: Option<TempDir>,
}

impl WorkingDirectory {
    pub fn create(auto_clean: bool) -> GatewayResult<Self> {
        let dir = tempfile::Builder::new().prefix("huter-").tempdir()?;
        fs_err::create_dir_all(dir.path().join(LOG_DIR))?;

        let (path, guard) = if auto_clean {
            info!(path = %dir.path().display(), "tmp dir to be deleted upon exit");
            (dir.path().to_path_buf(), Some(dir))
        } else {
            let path = dir.keep();
            info!(path = %path.display(), "leaving tmp dir undeleted");
            (path, None)
        };
        Ok(Self { path, guard })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory passed to the engine as its working root. The engine creates it.
    pub fn work_root(&self) -> PathBuf {
        self.path.join(WORK_ROOT)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join(LOG_DIR)
    }

    pub fn auto_clean(&self) -> bool {
        self.guard.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_clean_directory_is_removed_on_drop() {
        let dir = WorkingDirectory::create(true).unwrap();
        let path = dir.path().to_path_buf();
        assert!(dir.log_dir().is_dir());
        assert!(!dir.work_root().exists());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn kept_directory_survives_drop() {
        let dir = WorkingDirectory::create(false).unwrap();
        let path = dir.path().to_path_buf();
        assert!(!dir.auto_clean());
        drop(dir);
        assert!(path.join("logs").is_dir());
        fs_err::remove_dir_all(&path).unwrap();
    }
}
