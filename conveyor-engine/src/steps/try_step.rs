//! Try wrapper.

use async_trait::async_trait;

use crate::signals::{Ready, Signals};
use crate::step::{BoxStep, Step, Success};

/// Runs the inner step and absorbs both its failure and its error; a try
/// is always successful, so the surrounding plan carries on.
pub struct TryStep {
    step: BoxStep,
}

impl TryStep {
    pub fn new(step: BoxStep) -> Self {
        TryStep { step }
    }
}

#[async_trait]
impl Step for TryStep {
    async fn run(&mut self, signals: &mut Signals, ready: Ready) -> anyhow::Result<()> {
        if let Err(err) = self.step.run(signals, ready).await {
            tracing::info!(error = %err, "try step absorbed an error");
        }
        Ok(())
    }

    fn succeeded(&self) -> Option<Success> {
        Some(Success(true))
    }

    async fn release(&mut self) {
        self.step.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::signal_channel;
    use crate::steps::test_support::FakeStep;

    #[tokio::test]
    async fn try_is_successful_when_the_inner_step_fails() {
        let inner = FakeStep::failing();
        let inner_state = inner.state();

        let mut step = TryStep::new(Box::new(inner));
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();
        step.release().await;

        assert_eq!(step.succeeded(), Some(Success(true)));
        assert_eq!(inner_state.lock().unwrap().release_count, 1);
    }

    #[tokio::test]
    async fn try_absorbs_inner_errors() {
        let inner = FakeStep::erroring("exploded");

        let mut step = TryStep::new(Box::new(inner));
        let (_handle, mut signals) = signal_channel();
        assert!(step.run(&mut signals, Ready::inert()).await.is_ok());
        assert_eq!(step.succeeded(), Some(Success(true)));
    }
}
