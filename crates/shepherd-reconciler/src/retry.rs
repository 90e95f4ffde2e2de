//! Bounded-retry policies. All the fixed-iteration loops the reconciler runs
//! (state-file rename, remove-wait pid poll, volume remove, plugin connect)
//! are driven through one policy type and an injectable sleeper so tests run
//! them without real delays. Once entered, a loop runs to completion; there
//! is no cancellation token threaded through the reconciliation path.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that never sleeps; lets tests drive the bounded loops instantly.
pub struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Doubling(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self { max_attempts, backoff }
    }

    fn delay(&self, completed_attempts: u32) -> Option<Duration> {
        match self.backoff {
            Backoff::None => None,
            Backoff::Fixed(d) => Some(d),
            Backoff::Doubling(d) => Some(d * 2u32.saturating_pow(completed_attempts - 1)),
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted; the last error
    /// is returned verbatim.
    pub async fn run<T, E, F, Fut>(&self, sleeper: &dyn Sleeper, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(_) => {
                    if let Some(delay) = self.delay(attempt) {
                        sleeper.sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Poll `probe` until it reports true or attempts run out. Returns
    /// whether the condition was observed.
    pub async fn wait_until<F, Fut>(&self, sleeper: &dyn Sleeper, mut probe: F) -> bool
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if probe().await {
                return true;
            }
            if attempt >= self.max_attempts {
                return false;
            }
            if let Some(delay) = self.delay(attempt) {
                sleeper.sleep(delay).await;
            }
        }
    }
}
