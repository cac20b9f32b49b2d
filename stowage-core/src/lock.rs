use std::{
    fs::File,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use stowage_common::{ResultExt, StowageError, StowageResult};

pub const LOCK_FILE: &str = "lock";

/// Exclusive advisory lock on `<root>/lock`, held for the life of the daemon.
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct RootLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl RootLock {
    pub fn acquire(root: &Path) -> StowageResult<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create root {}", root.display()))?;
        let path = root.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                StowageError::InvalidState(format!(
                    "Another daemon holds the lock on {}",
                    root.display()
                ))
            } else {
                StowageError::Io(std::io::Error::from(errno)).context(format!("lock {}", path.display()))
            }
        })?;
        tracing::debug!(path = %path.display(), "Acquired root lock");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
