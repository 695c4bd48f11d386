use crate::error::PreviewError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Caps the number of decodes running at once. Waiters are served in FIFO order.
#[derive(Clone, Debug)]
pub struct DecodeLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// A held decode slot, returned to the pool when dropped.
#[derive(Debug)]
pub struct DecodePermit {
    _permit: OwnedSemaphorePermit,
}

impl DecodePermit {
    pub fn release(self) {}
}

impl DecodeLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free slot. Cancellation and a closed limiter both come back as `Cancelled`.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<DecodePermit, PreviewError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PreviewError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map(|permit| DecodePermit { _permit: permit })
                .map_err(|_| PreviewError::Cancelled),
        }
    }

    /// Wakes every waiter with `Cancelled` and refuses later acquisitions.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
