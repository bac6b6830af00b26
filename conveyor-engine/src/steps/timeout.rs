//! Wall-clock bound on a step.

use anyhow::anyhow;
use async_trait::async_trait;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::watch;

use conveyor_core::parse_duration;

use crate::clock::Clock;
use crate::signals::{signalled, Ready, Signal, Signals};
use crate::step::{BoxStep, Step, Success};

/// Runs the inner step, interrupting it once the injected clock has moved
/// past the configured duration. A tripped timeout is a failure, not an
/// error: `run` returns `Ok` and `succeeded` reports false.
pub struct TimeoutStep {
    duration: String,
    step: BoxStep,
    clock: Arc<dyn Clock>,
    timed_out: bool,
}

impl TimeoutStep {
    pub fn new(duration: String, step: BoxStep, clock: Arc<dyn Clock>) -> Self {
        TimeoutStep {
            duration,
            step,
            clock,
            timed_out: false,
        }
    }
}

#[async_trait]
impl Step for TimeoutStep {
    async fn run(&mut self, signals: &mut Signals, ready: Ready) -> anyhow::Result<()> {
        let duration = parse_duration(&self.duration)
            .map_err(|message| anyhow!("invalid timeout duration: {message}"))?;

        let (forward_tx, mut child_signals) = watch::channel(None);
        let clock = self.clock.clone();
        let mut outer = signals.clone();
        let mut forwarded = false;

        // absolute deadline, taken before the child runs at all
        let deadline_at = clock.now() + duration;

        let mut child = pin!(self.step.run(&mut child_signals, ready));
        let mut deadline = pin!(clock.sleep_until(deadline_at));

        loop {
            tokio::select! {
                result = child.as_mut() => {
                    if self.timed_out {
                        return Ok(());
                    }
                    return result;
                }
                _ = deadline.as_mut(), if !self.timed_out => {
                    self.timed_out = true;
                    let _ = forward_tx.send(Some(Signal::Interrupt));
                }
                signal = signalled(&mut outer), if !forwarded => {
                    forwarded = true;
                    let _ = forward_tx.send(Some(signal));
                }
            }
        }
    }

    fn succeeded(&self) -> Option<Success> {
        if self.timed_out {
            return Some(Success(false));
        }
        self.step.succeeded()
    }

    async fn release(&mut self) {
        self.step.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::signals::signal_channel;
    use crate::steps::test_support::FakeStep;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_duration_errors_immediately() {
        let clock = Arc::new(TestClock::new());
        let child = FakeStep::succeeding();
        let child_state = child.state();

        let mut step = TimeoutStep::new("nope".to_string(), Box::new(child), clock);
        let (_handle, mut signals) = signal_channel();
        assert!(step.run(&mut signals, Ready::inert()).await.is_err());
        assert_eq!(child_state.lock().unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn interrupts_a_step_that_outlives_the_duration() {
        let clock = Arc::new(TestClock::new());
        let advance = clock.clone();
        let child = FakeStep::succeeding()
            .on_run(move || advance.advance(Duration::from_secs(3600)))
            .waits_for_signal();
        let child_state = child.state();

        let mut step = TimeoutStep::new("1h".to_string(), Box::new(child), clock);
        let (_handle, mut signals) = signal_channel();
        let result = step.run(&mut signals, Ready::inert()).await;

        // no error, but not a success either
        assert!(result.is_ok());
        assert_eq!(step.succeeded(), Some(Success(false)));
        assert_eq!(
            child_state.lock().unwrap().received_signals,
            vec![Signal::Interrupt]
        );
    }

    #[tokio::test]
    async fn preserves_the_step_result_when_it_finishes_in_time() {
        let clock = Arc::new(TestClock::new());
        let advance = clock.clone();
        let child =
            FakeStep::succeeding().on_run(move || advance.advance(Duration::from_secs(1800)));

        let mut step = TimeoutStep::new("1h".to_string(), Box::new(child), clock.clone());
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();
        assert_eq!(step.succeeded(), Some(Success(true)));

        let advance = clock.clone();
        let failing =
            FakeStep::failing().on_run(move || advance.advance(Duration::from_secs(1800)));
        let mut step = TimeoutStep::new("1h".to_string(), Box::new(failing), clock);
        step.run(&mut signals, Ready::inert()).await.unwrap();
        assert_eq!(step.succeeded(), Some(Success(false)));
    }

    #[tokio::test]
    async fn propagates_step_errors() {
        let clock = Arc::new(TestClock::new());
        let child = FakeStep::erroring("some error");

        let mut step = TimeoutStep::new("1h".to_string(), Box::new(child), clock);
        let (_handle, mut signals) = signal_channel();
        let err = step.run(&mut signals, Ready::inert()).await.unwrap_err();
        assert_eq!(err.to_string(), "some error");
    }

    #[tokio::test]
    async fn forwards_outer_signals_to_the_step() {
        let clock = Arc::new(TestClock::new());
        let child = FakeStep::succeeding().waits_for_signal();
        let child_state = child.state();

        let mut step = TimeoutStep::new("1h".to_string(), Box::new(child), clock);
        let (handle, mut signals) = signal_channel();

        let runner = tokio::spawn(async move {
            let result = step.run(&mut signals, Ready::inert()).await;
            (step, result)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.send(Signal::Kill);
        let (step, result) = runner.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(
            child_state.lock().unwrap().received_signals,
            vec![Signal::Kill]
        );
        assert_eq!(step.succeeded(), Some(Success(true)));
    }
}
