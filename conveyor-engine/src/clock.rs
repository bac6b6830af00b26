//! Injected clock.
//!
//! Wall-clock behavior (only the timeout step has any) reads time through
//! this trait so tests can drive it deterministically.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic reading since an arbitrary origin.
    fn now(&self) -> Duration;

    /// Resolves once the clock has reached `deadline`. Deadlines are
    /// absolute so that a future polled late still measures from the
    /// moment the caller chose.
    async fn sleep_until(&self, deadline: Duration);

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if let Some(remaining) = deadline.checked_sub(now) {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// A clock that only moves when told to. Sleepers wake as soon as an
/// `advance` carries the clock past their deadline.
pub struct TestClock {
    now: watch::Sender<Duration>,
}

impl TestClock {
    pub fn new() -> Self {
        let (now, _) = watch::channel(Duration::ZERO);
        TestClock { now }
    }

    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> Duration {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: Duration) {
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_clock_sleep_wakes_on_advance() {
        let clock = Arc::new(TestClock::new());

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(60)).await })
        };

        // let the sleeper register its deadline before moving time
        tokio::time::sleep(Duration::from_millis(10)).await;

        clock.advance(Duration::from_secs(30));
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(30));
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleep should complete")
            .unwrap();
    }
}
