//! Reconnection with exponential backoff.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Retries a connect operation with exponentially growing, jittered delays.
///
/// Backoff state resets to the initial delay after every successful
/// connection. `max_attempts == 0` retries forever; `cancel()` stops an
/// in-flight attempt loop at its next sleep.
pub struct ReconnectionManager {
    initial_delay: f64,
    max_delay: f64,
    backoff_factor: f64,
    max_attempts: u32,
    jitter: f64,

    current_delay: Mutex<f64>,
    attempt_count: AtomicU32,
    successful_connections: AtomicU64,
    is_reconnecting: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl ReconnectionManager {
    pub fn new(
        initial_delay: f64,
        max_delay: f64,
        backoff_factor: f64,
        max_attempts: u32,
        jitter: f64,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor,
            max_attempts,
            jitter,
            current_delay: Mutex::new(initial_delay),
            attempt_count: AtomicU32::new(0),
            successful_connections: AtomicU64::new(0),
            is_reconnecting: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Keep calling `connect` until it succeeds, the attempt budget runs
    /// out, or the manager is cancelled. Returns whether a connection was
    /// established. A second caller entering while a loop is already running
    /// returns false immediately.
    pub async fn attempt_reconnect<F, Fut>(&self, mut connect: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self
            .is_reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let token = {
            let mut cancel = lock(&self.cancel);
            *cancel = CancellationToken::new();
            cancel.clone()
        };

        let result = self.run_attempts(&mut connect, &token).await;
        self.is_reconnecting.store(false, Ordering::SeqCst);
        result
    }

    async fn run_attempts<F, Fut>(&self, connect: &mut F, token: &CancellationToken) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        loop {
            let attempt = self.attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
            if self.max_attempts > 0 && attempt > self.max_attempts {
                tracing::error!(max_attempts = self.max_attempts, "reconnection attempts exhausted");
                return false;
            }

            tracing::info!(attempt, "reconnection attempt");
            match connect().await {
                Ok(()) => {
                    self.successful_connections.fetch_add(1, Ordering::SeqCst);
                    self.reset();
                    return true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reconnection attempt failed");
                }
            }

            let delay = self.next_delay();
            tracing::info!(delay_secs = delay, "waiting before next attempt");
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                () = token.cancelled() => {
                    tracing::info!("reconnection cancelled");
                    return false;
                }
            }
        }
    }

    /// Compute this round's sleep (current delay plus symmetric jitter,
    /// capped) and advance the backoff for the round after.
    fn next_delay(&self) -> f64 {
        let mut current = lock(&self.current_delay);
        let jitter_range = *current * self.jitter;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let delay = (*current + jitter).clamp(0.0, self.max_delay);
        *current = (*current * self.backoff_factor).min(self.max_delay);
        delay
    }

    fn reset(&self) {
        *lock(&self.current_delay) = self.initial_delay;
        self.attempt_count.store(0, Ordering::SeqCst);
    }

    /// Stop an ongoing attempt loop at its next backoff sleep.
    pub fn cancel(&self) {
        lock(&self.cancel).cancel();
    }

    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting.load(Ordering::SeqCst)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }

    pub fn current_delay(&self) -> f64 {
        *lock(&self.current_delay)
    }

    pub fn successful_connections(&self) -> u64 {
        self.successful_connections.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
