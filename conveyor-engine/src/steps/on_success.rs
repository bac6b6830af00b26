//! Success hook.

use async_trait::async_trait;

use crate::signals::{Ready, Signals};
use crate::step::{BoxStep, Step, Success};

/// Runs `step`, then `next` only when `step` succeeded. Overall success is
/// `next`'s when it ran, `step`'s otherwise.
pub struct OnSuccessStep {
    step: BoxStep,
    next: BoxStep,
    ran_next: bool,
}

impl OnSuccessStep {
    pub fn new(step: BoxStep, next: BoxStep) -> Self {
        OnSuccessStep {
            step,
            next,
            ran_next: false,
        }
    }
}

#[async_trait]
impl Step for OnSuccessStep {
    async fn run(&mut self, signals: &mut Signals, ready: Ready) -> anyhow::Result<()> {
        self.step.run(signals, ready).await?;

        if self.step.succeeded() == Some(Success(true)) {
            self.ran_next = true;
            self.next.run(signals, Ready::inert()).await?;
        }
        Ok(())
    }

    fn succeeded(&self) -> Option<Success> {
        if self.ran_next {
            self.next.succeeded()
        } else {
            self.step.succeeded()
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
    async fn runs_next_only_after_success() {
        let first = FakeStep::succeeding();
        let second = FakeStep::succeeding();
        let (first_state, second_state) = (first.state(), second.state());

        let mut step = OnSuccessStep::new(Box::new(first), Box::new(second));
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(first_state.lock().unwrap().run_count, 1);
        assert_eq!(second_state.lock().unwrap().run_count, 1);
        assert_eq!(step.succeeded(), Some(Success(true)));
    }

    #[tokio::test]
    async fn skips_next_when_step_fails() {
        let first = FakeStep::failing();
        let second = FakeStep::succeeding();
        let second_state = second.state();

        let mut step = OnSuccessStep::new(Box::new(first), Box::new(second));
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(second_state.lock().unwrap().run_count, 0);
        assert_eq!(step.succeeded(), Some(Success(false)));
    }

    #[tokio::test]
    async fn overall_success_is_nexts_when_it_ran() {
        let first = FakeStep::succeeding();
        let second = FakeStep::failing();

        let mut step = OnSuccessStep::new(Box::new(first), Box::new(second));
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(step.succeeded(), Some(Success(false)));
    }

    #[tokio::test]
    async fn errors_short_circuit_and_release_reaches_both() {
        let first = FakeStep::erroring("boom");
        let second = FakeStep::succeeding();
        let (first_state, second_state) = (first.state(), second.state());

        let mut step = OnSuccessStep::new(Box::new(first), Box::new(second));
        let (_handle, mut signals) = signal_channel();
        assert!(step.run(&mut signals, Ready::inert()).await.is_err());
        step.release().await;

        assert_eq!(second_state.lock().unwrap().run_count, 0);
        assert_eq!(first_state.lock().unwrap().release_count, 1);
        assert_eq!(second_state.lock().unwrap().release_count, 1);
    }
}
