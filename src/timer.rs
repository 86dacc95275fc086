//! One-shot deferred callbacks driving conversation timeouts
//!
//! Each scheduled timer sleeps on its own lightweight task. Once the delay has
//! passed, the callback is handed to a bounded pool of workers whose size is set
//! when the [`TimerService`] is created. Cancelling a timer that already fired
//! or was cancelled before is a no-op.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Schedules callbacks to be executed after a delay
#[derive(Clone)]
pub struct TimerService {
    workers: Arc<Semaphore>,
    pool_size: usize,
}

impl TimerService {
    /// Creates a new service executing at most `pool_size` callbacks concurrently
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);

        Self {
            workers: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    /// Maximum number of concurrently executing callbacks
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Executes `callback` once `delay` has passed unless the returned handle is cancelled first.
    ///
    /// Panics raised by the callback are caught and logged.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let timer_state = state.clone();
        let workers = self.workers.clone();

        let sleeper = tokio::spawn(async move {
            sleep(delay).await;

            if timer_state
                .compare_exchange(PENDING, FIRED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            // Detached from the sleeper so that aborting it can never interrupt a running callback
            tokio::spawn(async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("Timer service has been shut down, dropping callback");
                        return;
                    }
                };

                if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
                    error!("Timer callback panicked");
                }
            });
        });

        TimerHandle { state, sleeper }
    }

    /// Stops executing callbacks of timers which have not yet started
    pub fn shutdown(&self) {
        debug!("Shutting down timer service");
        self.workers.close();
    }
}

/// Handle of a scheduled timer
pub struct TimerHandle {
    state: Arc<AtomicU8>,
    sleeper: JoinHandle<()>,
}

impl TimerHandle {
    /// Prevents the callback from being executed.
    ///
    /// Returns whether the timer was still pending. Calling this multiple times
    /// or after the timer fired does nothing.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if cancelled {
            self.sleeper.abort();
        }

        cancelled
    }

    /// Whether the timer has neither fired nor been cancelled
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING
    }
}
