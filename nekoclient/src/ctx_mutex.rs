use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};

/// Mutex whose acquisition gives up once the caller's [CancellationToken] fires.
///
/// Waiters are served in the order they started waiting. The lock is released when the returned
/// guard is dropped; the guard owns a handle to the mutex so it can outlive the borrow of `self`.
#[derive(Debug, Default)]
pub struct CtxMutex<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> CtxMutex<T> {
    pub fn new(value: T) -> Self {
        CtxMutex {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Wait for the lock, or fail with [ClientError::Cancelled] if `cancel` fires first
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<OwnedMutexGuard<T>> {
        tokio::select! {
            // checked first so an already-cancelled caller never takes a free lock
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            guard = Arc::clone(&self.inner).lock_owned() => Ok(guard),
        }
    }
}
