//! Ensure hook.

use async_trait::async_trait;

use crate::signals::{Ready, Signals};
use crate::step::{BoxStep, Step, Success};

/// Runs `next` after `step` no matter how `step` came out. Overall success
/// requires both; `step`'s error takes precedence over `next`'s.
pub struct EnsureStep {
    step: BoxStep,
    next: BoxStep,
}

impl EnsureStep {
    pub fn new(step: BoxStep, next: BoxStep) -> Self {
        EnsureStep { step, next }
    }
}

#[async_trait]
impl Step for EnsureStep {
    async fn run(&mut self, signals: &mut Signals, ready: Ready) -> anyhow::Result<()> {
        let step_result = self.step.run(signals, ready).await;
        let ensure_result = self.next.run(signals, Ready::inert()).await;

        step_result?;
        ensure_result
    }

    fn succeeded(&self) -> Option<Success> {
        match (self.step.succeeded(), self.next.succeeded()) {
            (Some(a), Some(b)) => Some(Success(a.0 && b.0)),
            _ => None,
        }
    }

    async fn release(&mut self) {
        self.step.release().await;
        self.next.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::signal_channel;
    use crate::steps::test_support::FakeStep;

    #[tokio::test]
    async fn ensure_runs_even_when_step_fails() {
        let first = FakeStep::failing();
        let cleanup = FakeStep::succeeding();
        let cleanup_state = cleanup.state();

        let mut step = EnsureStep::new(Box::new(first), Box::new(cleanup));
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(cleanup_state.lock().unwrap().run_count, 1);
        assert_eq!(step.succeeded(), Some(Success(false)));
    }

    #[tokio::test]
    async fn ensure_runs_even_when_step_errors() {
        let first = FakeStep::erroring("boom");
        let cleanup = FakeStep::succeeding();
        let cleanup_state = cleanup.state();

        let mut step = EnsureStep::new(Box::new(first), Box::new(cleanup));
        let (_handle, mut signals) = signal_channel();
        let err = step.run(&mut signals, Ready::inert()).await.unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(cleanup_state.lock().unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn success_requires_both() {
        let first = FakeStep::succeeding();
        let cleanup = FakeStep::failing();

        let mut step = EnsureStep::new(Box::new(first), Box::new(cleanup));
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(step.succeeded(), Some(Success(false)));
    }
}
