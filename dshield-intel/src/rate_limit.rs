//! Per-source rate windows and concurrency permits
//!
//! Each source owns a sliding 60-second log of request timestamps and a
//! counting semaphore. A query must hold a permit and a window slot before
//! contacting the source. The window's critical section evicts stale
//! timestamps, checks capacity, and appends the new timestamp; the lock is
//! released before any outbound call. Cancelled waiters never consume
//! quota because the timestamp is only appended on admission.

use dshield_core::{DshieldError, DshieldResult, ThreatSource};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};

/// Length of the sliding window.
const WINDOW: Duration = Duration::from_secs(60);

enum Admission {
    Admitted,
    RetryAfter(Duration),
}

/// Rate and concurrency budget for one source.
#[derive(Debug)]
pub struct SourceBudget {
    source: ThreatSource,
    rate_limit: usize,
    max_backoff_attempts: u32,
    window: Mutex<VecDeque<Instant>>,
    semaphore: Arc<Semaphore>,
}

impl SourceBudget {
    pub fn new(
        source: ThreatSource,
        rate_limit_rpm: u32,
        concurrency_limit: usize,
        max_backoff_attempts: u32,
    ) -> Self {
        Self {
            source,
            rate_limit: rate_limit_rpm.max(1) as usize,
            max_backoff_attempts,
            window: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    /// Acquire the concurrency permit, then wait out the rate window.
    ///
    /// The returned permit is owned: dropping it on any exit path,
    /// including cancellation, releases the slot.
    pub async fn acquire(&self) -> DshieldResult<OwnedSemaphorePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DshieldError::internal("source semaphore closed"))?;

        let mut attempt = 0u32;
        loop {
            match self.try_admit() {
                Admission::Admitted => return Ok(permit),
                Admission::RetryAfter(wait) => {
                    if attempt >= self.max_backoff_attempts {
                        return Err(DshieldError::RateLimitExceeded {
                            scope: self.source.label().to_string(),
                        });
                    }
                    tracing::debug!(
                        source = %self.source,
                        wait_ms = wait.as_millis() as u64,
                        attempt,
                        "rate window full, waiting"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    fn try_admit(&self) -> Admission {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());

        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() < self.rate_limit {
            window.push_back(now);
            Admission::Admitted
        } else {
            let oldest = *window.front().expect("window is non-empty at capacity");
            Admission::RetryAfter(WINDOW.saturating_sub(now.duration_since(oldest)))
        }
    }

    /// Timestamps currently inside the window.
    pub fn in_flight_window(&self) -> usize {
        let now = Instant::now();
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| now.duration_since(**t) < WINDOW)
            .count()
    }

    /// Free concurrency slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
