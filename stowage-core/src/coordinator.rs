use std::sync::atomic::{AtomicBool, Ordering};

use stowage_common::{StowageError, StowageResult};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Single reader/writer lock around the daemon state.
///
/// Mutating operations hold the write guard for their whole duration, driver calls and uploads
/// included. Once [`Coordinator::shutdown`] returns no new guard is handed out.
#[derive(Debug)]
pub struct Coordinator<T> {
    state: RwLock<T>,
    closed: AtomicBool,
}

impl<T> Coordinator<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> StowageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StowageError::InvalidState(
                "The daemon is shutting down".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn read(&self) -> StowageResult<RwLockReadGuard<'_, T>> {
        self.check_open()?;
        let guard = self.state.read().await;
        self.check_open()?;
        Ok(guard)
    }

    pub async fn write(&self) -> StowageResult<RwLockWriteGuard<'_, T>> {
        self.check_open()?;
        let guard = self.state.write().await;
        self.check_open()?;
        Ok(guard)
    }

    /// Wait for the in-flight writer (and readers) to finish, then refuse new operations.
    pub async fn shutdown(&self) {
        let _guard = self.state.write().await;
        self.closed.store(true, Ordering::Release);
        tracing::info!("Coordinator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
