use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Bounds the number of jobs in flight and paces submit calls.
#[derive(Debug)]
pub struct SubmissionThrottle {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

/// Capacity held by one job. Dropping it frees the slot.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl SubmissionThrottle {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Waits until capacity frees up. Returns [`None`] if the batch is cancelled first.
    pub async fn admit(&self, cancel: &CancellationToken) -> Option<Admission> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => {
                permit.ok().map(|permit| Admission { _permit: permit })
            }
        }
    }

    /// Waits for the next submission slot. Returns `false` if cancelled while waiting.
    ///
    /// Slots are handed out in call order, `min_interval` apart.
    pub async fn pace(&self, cancel: &CancellationToken) -> bool {
        let slot = {
            let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = next.map_or(now, |next| next.max(now));
            *next = Some(slot + self.min_interval);
            slot
        };

        if slot <= Instant::now() {
            return !cancel.is_cancelled();
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = sleep_until(slot) => true,
        }
    }

    /// Jobs currently holding capacity.
    pub fn admitted(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
